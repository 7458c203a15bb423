use clap::{Parser, Subcommand};

use kjarni_knnmt::KnnArgs;

pub mod commands;

#[derive(Parser)]
#[command(name = "kjarni-knn")]
#[command(about = "Inspect and query kNN translation datastores", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Show the size and layout of a datastore
    Info {
        /// Datastore directory
        path: String,

        /// Output format: text, json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Find the nearest datastore entries for query vectors
    Search {
        /// Datastore directory
        path: String,

        /// Query vector as comma-separated floats; separate several queries with ';'
        #[arg(short, long)]
        query: String,

        /// Number of neighbours per query
        #[arg(short = 'k', long, default_value_t = 8)]
        top_k: usize,

        /// File of entry ids to restrict the search to
        #[arg(long)]
        subset_path: Option<String>,

        /// Output format: json, jsonl, text
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Resolve knn flags against the configuration file and print the result
    Config {
        #[command(flatten)]
        knn: KnnArgs,

        /// Check that the configuration is complete for its mode
        #[arg(long)]
        validate: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_args() {
        let cli = Cli::parse_from([
            "kjarni-knn", "-vv", "search", "/data/ds", "--query", "0.1,0.2", "-k", "4",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(
            cli.command,
            Commands::Search {
                path: "/data/ds".to_string(),
                query: "0.1,0.2".to_string(),
                top_k: 4,
                subset_path: None,
                format: "text".to_string(),
            }
        );
    }

    #[test]
    fn test_config_flattens_knn_flags() {
        let cli = Cli::parse_from([
            "kjarni-knn",
            "config",
            "--knn-mode",
            "inference",
            "--knn-k",
            "16",
            "--lambda-list",
            "0.1,0.2",
            "--validate",
        ]);
        match cli.command {
            Commands::Config { knn, validate } => {
                assert!(validate);
                assert_eq!(knn.knn_mode.as_deref(), Some("inference"));
                assert_eq!(knn.knn_k, Some(16));
                assert_eq!(knn.lambda_list, Some(vec![0.1, 0.2]));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command() {
        assert!(Cli::try_parse_from(["kjarni-knn", "not-a-command"]).is_err());
    }
}
