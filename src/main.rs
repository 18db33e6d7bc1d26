use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let workspace_root = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir().expect("failed to resolve current directory"),
    };

    match chrono_tasks_sync::run(&workspace_root).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("chrono-tasks-sync: {error}");
            ExitCode::FAILURE
        }
    }
}
