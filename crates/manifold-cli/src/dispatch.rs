use std::io::Write;
use std::path::Path;

use comfy_table::Cell;

use manifold_core::index::TagEdit;
use manifold_core::orchestrator::{Located, Orchestrator, SyncPlan, UploadOutcome};
use manifold_types::{ContentHash, ManifoldError, Result};

use crate::cli::Commands;
use crate::format::{format_bytes, format_capacity};
use crate::table::{add_kv_row, TableTheme};

pub(crate) fn dispatch_command(
    command: &Commands,
    orchestrator: &Orchestrator,
    service: Option<&str>,
) -> Result<()> {
    match command {
        Commands::List { .. } => run_list(orchestrator, service),
        Commands::Has { hashes } => run_has(orchestrator, hashes),
        Commands::Put { paths, .. } => run_put(orchestrator, service, paths),
        Commands::Get {
            identifiers, dest, ..
        } => run_get(orchestrator, service, identifiers, dest),
        Commands::Remove {
            identifier, yes, ..
        } => run_remove(orchestrator, service, identifier, *yes),
        Commands::Tag {
            identifiers,
            add,
            remove,
            set,
            ..
        } => {
            let edit = TagEdit {
                add: add.clone(),
                remove: remove.clone(),
                set: set.clone(),
            };
            run_tag(orchestrator, service, identifiers, &edit)
        }
        Commands::Search { query, fuzzy, .. } => run_search(orchestrator, service, query, *fuzzy),
        Commands::Cap => run_cap(orchestrator),
        Commands::Sync { apply, yes } => run_sync(orchestrator, *apply, *yes),
        Commands::Refresh { .. } => run_refresh(orchestrator, service),
        // Handled before an orchestrator exists.
        Commands::Config { .. } => Ok(()),
    }
}

fn print_records(rows: &[Located]) {
    let theme = TableTheme::detect();
    let mut table = theme.data_table(&["NAME", "SIZE", "SERVICE", "TAGS", "ID"]);
    for Located { backend, record } in rows {
        table.add_row(vec![
            Cell::new(&record.name),
            Cell::new(format_bytes(record.size)),
            Cell::new(backend),
            Cell::new(record.tags.join(",")),
            Cell::new(&record.id),
        ]);
    }
    println!("{table}");
}

fn run_list(orchestrator: &Orchestrator, service: Option<&str>) -> Result<()> {
    let rows = match service {
        Some(nickname) => orchestrator
            .on_backend(nickname, |e| e.list_files())?
            .into_iter()
            .map(|record| Located {
                backend: nickname.to_string(),
                record,
            })
            .collect(),
        None => orchestrator.list_files(),
    };
    if rows.is_empty() {
        println!("No files tracked.");
        return Ok(());
    }
    print_records(&rows);
    println!("{} file(s)", rows.len());
    Ok(())
}

fn run_has(orchestrator: &Orchestrator, hashes: &[String]) -> Result<()> {
    let mut missing = 0;
    for hash in hashes {
        let hash = ContentHash::parse(hash)?;
        match orchestrator.has(&hash) {
            Some(nickname) => println!("{hash} is held by '{nickname}'"),
            None => {
                println!("{hash} is not held by any service");
                missing += 1;
            }
        }
    }
    if missing > 0 {
        return Err(ManifoldError::NotFound(format!(
            "{missing} of {} hash(es)",
            hashes.len()
        )));
    }
    Ok(())
}

fn run_put(orchestrator: &Orchestrator, service: Option<&str>, paths: &[String]) -> Result<()> {
    for path in paths {
        let path = Path::new(path);
        match service {
            Some(nickname) => {
                let record = orchestrator.on_backend(nickname, |e| e.upload(path, None))?;
                println!("{}: stored on '{nickname}' as {}", record.name, record.id);
            }
            None => match orchestrator.upload(path)? {
                UploadOutcome::Stored { backend, record } => {
                    println!("{}: stored on '{backend}' as {}", record.name, record.id);
                }
                UploadOutcome::AlreadyPresent { backend, record } => {
                    println!(
                        "{}: already held by '{backend}' as '{}', skipped",
                        path.display(),
                        record.name
                    );
                }
            },
        }
    }
    Ok(())
}

fn run_get(
    orchestrator: &Orchestrator,
    service: Option<&str>,
    identifiers: &[String],
    dest: &str,
) -> Result<()> {
    let root = Path::new(dest);
    for identifier in identifiers {
        let (backend, fetched) = match service {
            Some(nickname) => (
                nickname.to_string(),
                orchestrator.on_backend(nickname, |e| e.download(root, identifier))?,
            ),
            None => orchestrator.download(root, identifier)?,
        };
        println!(
            "{} ({}) from '{backend}' -> {}",
            fetched.record.name,
            format_bytes(fetched.record.size),
            fetched.path.display()
        );
    }
    Ok(())
}

fn run_remove(
    orchestrator: &Orchestrator,
    service: Option<&str>,
    identifier: &str,
    yes: bool,
) -> Result<()> {
    let scope = service.unwrap_or("every service");
    if !yes && !confirm(&format!("Remove '{identifier}' from {scope}?"))? {
        println!("Aborted.");
        return Ok(());
    }
    let removed = match service {
        Some(nickname) => {
            let record = orchestrator.on_backend(nickname, |e| {
                let hash = e.resolve(identifier)?.primary_hash().clone();
                e.remove(&hash)
            })?;
            vec![Located {
                backend: nickname.to_string(),
                record,
            }]
        }
        None => orchestrator.remove(identifier)?,
    };
    for Located { backend, record } in &removed {
        println!("Removed {} from '{backend}'", record.name);
    }
    Ok(())
}

fn run_tag(
    orchestrator: &Orchestrator,
    service: Option<&str>,
    identifiers: &[String],
    edit: &TagEdit,
) -> Result<()> {
    if edit.is_empty() {
        return Err(ManifoldError::Other(
            "no tag changes requested; pass --add, --remove, or --set".to_string(),
        ));
    }
    let updated = match service {
        Some(nickname) => orchestrator
            .on_backend(nickname, |e| e.tag(identifiers, edit))?
            .into_iter()
            .map(|record| Located {
                backend: nickname.to_string(),
                record,
            })
            .collect(),
        None => orchestrator.tag(identifiers, edit)?,
    };
    if updated.is_empty() {
        return Err(ManifoldError::NotFound(identifiers.join(", ")));
    }
    for Located { backend, record } in &updated {
        println!("{} [{}]: {}", record.name, backend, record.tags.join(","));
    }
    Ok(())
}

fn run_search(
    orchestrator: &Orchestrator,
    service: Option<&str>,
    query: &str,
    fuzzy: bool,
) -> Result<()> {
    let rows = match service {
        Some(nickname) => orchestrator
            .on_backend(nickname, |e| {
                if fuzzy {
                    e.fuzzy_search_by_name(query)
                } else {
                    e.search_by_name(query)
                }
            })?
            .into_iter()
            .map(|record| Located {
                backend: nickname.to_string(),
                record,
            })
            .collect(),
        None => orchestrator.search_by_name(query, fuzzy),
    };
    if rows.is_empty() {
        println!("No matches for '{query}'.");
        return Ok(());
    }
    print_records(&rows);
    Ok(())
}

fn run_cap(orchestrator: &Orchestrator) -> Result<()> {
    let report = orchestrator.capacity();
    let theme = TableTheme::detect();
    let mut table = theme.data_table(&["SERVICE", "USED", "ALLOWED", "TOTAL"]);
    for (nickname, outcome) in &report.per_backend {
        match outcome {
            Ok(cap) => table.add_row(vec![
                Cell::new(nickname),
                Cell::new(format_bytes(cap.used)),
                Cell::new(format_capacity(cap.allowed())),
                Cell::new(format_capacity(cap.total)),
            ]),
            Err(err) => table.add_row(vec![
                Cell::new(nickname),
                Cell::new(format!("unavailable: {err}")),
                Cell::new("-"),
                Cell::new("-"),
            ]),
        };
    }
    println!("{table}");

    let mut totals = theme.kv_table();
    add_kv_row(&mut totals, theme, "Used", format_bytes(report.used));
    add_kv_row(&mut totals, theme, "Allowed", format_capacity(report.allowed));
    add_kv_row(&mut totals, theme, "Total", format_capacity(report.total));
    println!("{totals}");

    if report.partial {
        eprintln!("Warning: some services did not respond; totals are lower bounds.");
    }
    Ok(())
}

fn print_plan(plan: &SyncPlan) {
    for nickname in &plan.excluded {
        eprintln!("Warning: '{nickname}' did not respond and is excluded from this pass.");
    }
    if plan.addition_count() > 0 {
        println!("Planned additions:");
        for (backend, hashes) in &plan.additions {
            for hash in hashes {
                let size = plan.sizes.get(hash).copied().unwrap_or(0);
                println!("  {backend} <- {hash} ({})", format_bytes(size));
            }
        }
    }
    if plan.removal_count() > 0 {
        println!("Over-quota replicas (reported only, never removed automatically):");
        for (backend, hashes) in &plan.removals {
            for hash in hashes {
                println!("  {backend} : {hash}");
            }
        }
    }
}

fn run_sync(orchestrator: &Orchestrator, apply: bool, yes: bool) -> Result<()> {
    let plan = orchestrator.plan_sync();
    if plan.is_noop() {
        println!("All services converged; nothing to do.");
        return Ok(());
    }
    print_plan(&plan);

    if !apply {
        println!("Dry run. Re-run with --apply to transfer.");
        return Ok(());
    }
    if plan.addition_count() == 0 {
        println!("No additions to apply.");
        return Ok(());
    }
    if !yes
        && !confirm(&format!(
            "Transfer {} replica(s) as planned?",
            plan.addition_count()
        ))?
    {
        println!("Aborted.");
        return Ok(());
    }

    let report = orchestrator.apply_sync(&plan);
    println!("Transferred {} replica(s).", report.transferred.len());
    if !report.failures.is_empty() {
        for failure in &report.failures {
            eprintln!(
                "Failed: {} -> '{}': {}",
                failure.hash, failure.backend, failure.error
            );
        }
        return Err(ManifoldError::Other(format!(
            "{} transfer(s) failed; re-running sync is safe",
            report.failures.len()
        )));
    }
    Ok(())
}

fn run_refresh(orchestrator: &Orchestrator, service: Option<&str>) -> Result<()> {
    let results = match service {
        Some(nickname) => vec![(
            nickname.to_string(),
            orchestrator.on_backend(nickname, |e| e.refresh()),
        )],
        None => orchestrator.refresh(),
    };
    let mut failed = 0;
    for (nickname, outcome) in results {
        match outcome {
            Ok(()) => println!("'{nickname}': catalog refreshed"),
            Err(err) => {
                eprintln!("'{nickname}': {err}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(ManifoldError::Other(format!(
            "{failed} service(s) failed to refresh"
        )));
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
