pub mod chooser;
pub mod dispatch;
pub mod driver;
pub mod grid;
pub mod local;
pub mod lock;
pub mod objective;
pub mod runner;

pub use chooser::{
    parse_chooser_args, Choice, Chooser, ChooserCtor, ChooserRegistry, RandomChooser,
    SequentialChooser,
};
pub use dispatch::{
    all_ids, attempt_dispatch, best_job_path, check_experiment_dirs, run_dispatch_loop,
    trace_path, write_best_job, write_trace, DispatchOptions,
};
pub use driver::{Driver, DriverConfig, DriverCtor, DriverRegistry, ExecutionHandle};
pub use grid::{sample_grid, FileGridStore, GridSnapshot, GridState, GridStatus, GridStore};
pub use local::LocalDriver;
pub use lock::GridLock;
pub use objective::{parse_objective_output, CommandObjective, Objective};
pub use runner::{run_job, run_job_file, JobOutcome};
