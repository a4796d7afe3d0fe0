pub mod config;
pub mod distribute;
pub mod index;
pub mod orchestrator;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
