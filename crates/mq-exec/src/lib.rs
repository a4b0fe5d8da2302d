pub mod command;
pub mod error;
pub mod runner;
pub mod types;
pub mod workspace;

pub use command::*;
pub use error::*;
pub use runner::*;
pub use types::*;
pub use workspace::*;

#[cfg(test)]
mod tests {
    use super::{run_job, CancelCheck, ExecError, ExecSettings, NoCancel, RecordLogs, RunOutcome};
    use std::any::TypeId;

    #[test]
    fn crate_root_reexports_types() {
        let _ = TypeId::of::<ExecError>();
        let _ = TypeId::of::<ExecSettings>();
        let _ = TypeId::of::<RecordLogs>();
        let _ = TypeId::of::<RunOutcome>();
    }

    #[test]
    fn crate_root_reexports_runner() {
        let _run: fn(
            &mq_core::Job,
            &ExecSettings,
            &mut dyn CancelCheck,
        ) -> Result<RunOutcome, ExecError> = run_job;
        let _probe: &dyn CancelCheck = &NoCancel;
    }
}
