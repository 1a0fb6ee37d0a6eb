pub mod reconcile;

pub use reconcile::{ReconcileSink, ReconcileWorker};
