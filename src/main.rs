use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use inquire::error::InquireResult;

mod backup;
mod chunks;
mod cli;
mod cluster;
mod config;
mod eid;
mod embedding;
mod knowledge;
mod service;
mod store;
#[cfg(test)]
mod tests;

use cluster::{Algorithm, ProgressReport, ProgressStage};
use config::Config;
use service::KnowledgeService;

fn default_base_path() -> PathBuf {
    homedir::my_home()
        .ok()
        .flatten()
        .map(|home| home.join(".kb"))
        .unwrap_or_else(|| PathBuf::from(".kb"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = cli::Args::parse();
    let base_path = args.data_dir.clone().unwrap_or_else(default_base_path);
    tracing::debug!("using data directory {}", base_path.display());

    match args.command {
        cli::Command::Export { output } => {
            backup::create_backup(output, &base_path)?;
            return Ok(());
        }

        cli::Command::Import { archive, yes } => {
            backup::import_backup(archive.as_deref(), yes, &base_path)?;
            return Ok(());
        }

        command => {
            let mut config = Config::load_with(&base_path)?;

            if let cli::Command::Build {
                algorithm: Some(ref name),
                ..
            } = command
            {
                config.clustering.algorithm = parse_algorithm(name)?;
            }

            let service = Arc::new(KnowledgeService::new(config, base_path)?);

            // flush dirty state on ctrl-c and on the periodic timer
            {
                let service = service.clone();
                ctrlc::set_handler(move || {
                    service.flush();
                    std::process::exit(130);
                })?;
            }
            service::spawn_autosave(service.clone());

            run_command(command, &service)
        }
    }
}

fn run_command(command: cli::Command, service: &KnowledgeService) -> anyhow::Result<()> {
    match command {
        cli::Command::Build { input, quiet, .. } => {
            let chunks = chunks::load_chunks(&input)?;
            println!("Clustering {} chunks...", chunks.len());

            let statistics = if quiet {
                service.build(chunks, None)?
            } else {
                let bar = indicatif::ProgressBar::new(100);
                bar.set_style(
                    indicatif::ProgressStyle::with_template(
                        "{msg:12} [{bar:40.cyan/blue}] {percent}%",
                    )
                    .expect("static template is valid")
                    .progress_chars("=> "),
                );

                let callback = |report: ProgressReport| {
                    bar.set_message(match report.stage {
                        ProgressStage::Embeddings => "embeddings",
                        ProgressStage::Clustering => "clustering",
                    });
                    bar.set_position(report.percentage as u64);
                };
                let statistics = service.build(chunks, Some(&callback))?;
                bar.finish_and_clear();
                statistics
            };

            println!("{}", serde_json::to_string_pretty(&statistics)?);
            Ok(())
        }

        cli::Command::Query {
            text,
            top_k,
            no_record,
        } => {
            let hits = service.query(&text, top_k, !no_record)?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
            Ok(())
        }

        cli::Command::Progress {} => {
            let summary = service.progress()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }

        cli::Command::Reset { yes } => {
            if !yes {
                match inquire::prompt_confirmation(
                    "This will destroy all recorded knowledge progress, including backups. Are you sure?",
                ) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            service.reset()?;
            println!("Knowledge state reset.");
            Ok(())
        }

        // handled before the service is constructed
        cli::Command::Export { .. } | cli::Command::Import { .. } => unreachable!(),
    }
}

fn parse_algorithm(name: &str) -> anyhow::Result<Algorithm> {
    match name.to_lowercase().as_str() {
        "hierarchical" => Ok(Algorithm::Hierarchical),
        "dbscan" => Ok(Algorithm::Dbscan),
        other => bail!("unknown algorithm '{other}', expected 'hierarchical' or 'dbscan'"),
    }
}
