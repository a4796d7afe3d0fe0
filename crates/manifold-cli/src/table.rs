use std::io::IsTerminal;

use comfy_table::{presets::NOTHING, Attribute, Cell, Table};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TableTheme {
    pub use_color: bool,
}

impl TableTheme {
    pub(crate) fn detect() -> Self {
        let is_tty = std::io::stdout().is_terminal();
        let no_color = std::env::var_os("NO_COLOR").is_some();
        resolve_theme(is_tty, no_color)
    }

    pub(crate) fn data_table(self, headers: &[&str]) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_header(headers.iter().map(|h| self.bold_cell(h)).collect::<Vec<_>>());
        table
    }

    pub(crate) fn kv_table(self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table
    }

    pub(crate) fn bold_cell(self, text: &str) -> Cell {
        let mut cell = Cell::new(text);
        if self.use_color {
            cell = cell.add_attribute(Attribute::Bold);
        }
        cell
    }
}

fn resolve_theme(is_tty: bool, no_color: bool) -> TableTheme {
    TableTheme {
        use_color: is_tty && !no_color,
    }
}

pub(crate) fn add_kv_row(table: &mut Table, theme: TableTheme, field: &str, value: impl ToString) {
    table.add_row(vec![theme.bold_cell(field), Cell::new(value.to_string())]);
}
