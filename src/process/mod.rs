/// Side-effecting actions on managed projects
/// Stop escalates SIGTERM -> SIGKILL with bounded waits; start launches the project's
/// start script detached. Both defer to pm2 when the project is managed there.

pub mod control;

pub use control::{
    ProcessControl,
    RestartReport,
    StartOutcome,
    StartReport,
    StopOutcome,
};
