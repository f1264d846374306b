mod barrier;
mod child;
mod config;
mod ids;
mod overlay;
mod pulse;
mod supervisor;
mod syscall;

pub use config::{ConfigError, Namespaces, SandboxConfig, HOME_DIR, SKIP_DIRS};
pub use supervisor::{run, Outcome};

fn result_to_isize<R, E: std::fmt::Debug>(name: &str, result: Result<R, E>) -> isize {
    match result {
        Ok(_) => 0,
        Err(error) => {
            tracing::error!(?error, "{} failed", name);
            -1
        }
    }
}
