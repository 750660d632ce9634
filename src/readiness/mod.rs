pub mod bootstrap;
pub mod conditions;
pub mod dryrun;
pub mod selector;
pub mod state;
pub mod status;
pub mod taints;
