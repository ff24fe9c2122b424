// SPDX-License-Identifier: MIT

use anyhow::Context;
use casefile_rs::casefile::app::App;
use casefile_rs::casefile::config::Settings;
use casefile_rs::casefile::server;
use casefile_rs::casefile::workflow::graph::{NoopObserver, RunRequest, TaskTable};
use casefile_rs::casefile::workflow::loader::PipelineLoader;
use clap::{Parser, Subcommand};
use dotenv::dotenv;

use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API
    Serve {
        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },
    /// Analyse a document once and print the export
    Run {
        /// Source document; optional when the session already has one
        #[arg(short, long)]
        file: Option<String>,

        /// Comma-separated task names
        #[arg(short, long, value_delimiter = ',')]
        tasks: Vec<String>,

        #[arg(short, long, default_value = "cli")]
        session: String,

        /// Recompute requested tasks even if already done
        #[arg(long)]
        force: bool,
    },
    /// List the tasks of the configured pipeline
    Tasks,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    match args.command {
        Commands::Serve { port } => {
            let app = Arc::new(App::from_settings(&settings).await?);
            server::serve(app, port, settings.session_ttl).await?;
        }
        Commands::Run {
            file,
            tasks,
            session,
            force,
        } => {
            let app = App::from_settings(&settings).await?;

            let mut request = RunRequest::new(session.clone(), tasks);
            request.force = force;
            if let Some(path) = file {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path))?;
                request = request.with_document(path, bytes);
            }

            let report = app.scheduler().run(request, &NoopObserver).await?;
            log::info!(
                "Executed {:?}, skipped {:?}",
                report.executed,
                report.skipped
            );
            for failure in &report.failures {
                eprintln!("failed: {}", failure);
            }

            let rendered = app.export(&session).await?;
            println!("{}", String::from_utf8_lossy(&rendered.bytes));
        }
        Commands::Tasks => {
            let loader = PipelineLoader::new();
            let def = match &settings.pipeline_path {
                Some(path) => loader.load_pipeline(path)?,
                None => loader.builtin()?,
            };
            let table = TaskTable::from_definition(&def)?;

            println!("Pipeline: {} (fixed: {})", def.name, table.fixed().join(", "));
            for spec in table.specs() {
                let after = if spec.prerequisites.is_empty() {
                    String::new()
                } else {
                    format!(" after [{}]", spec.prerequisites.join(", "))
                };
                println!(
                    "  {:<20} {} -> {}{}",
                    spec.name,
                    spec.requires.join(", "),
                    spec.produces.join(", "),
                    after
                );
            }
        }
    }

    Ok(())
}
