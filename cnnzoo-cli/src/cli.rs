//! Command line definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// cnnzoo - VGG and ResNeXt image classifiers
#[derive(Parser, Debug)]
#[command(name = "cnnzoo", version, about = "Inspect and run VGG / ResNeXt image classifiers")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the layer tree, output shapes and parameter counts of a model
    Inspect(InspectArgs),

    /// Run a forward pass on a random image batch
    Run(RunArgs),

    /// List the built-in presets
    List,
}

/// Which model to build: a preset name or a JSON configuration file.
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Preset name (vgg11, vgg13, vgg16, vgg19, resnext50_2x32d)
    #[arg(required_unless_present = "config")]
    pub model: Option<String>,

    /// JSON model configuration, tagged with "arch"
    #[arg(short, long, conflicts_with = "model")]
    pub config: Option<PathBuf>,

    /// Seed for weight initialization
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Input spatial size used to compute output shapes
    #[arg(short, long, default_value_t = 32)]
    pub size: usize,

    /// How many levels of the layer tree to print
    #[arg(short, long, default_value_t = 2)]
    pub depth: usize,

    /// Print the resolved configuration as JSON instead of the layer tree
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Batch size
    #[arg(short, long, default_value_t = 1)]
    pub batch: usize,

    /// Input height and width
    #[arg(short, long, default_value_t = 32)]
    pub size: usize,

    /// Seed for the random input batch
    #[arg(long, default_value_t = 0)]
    pub input_seed: u64,

    /// Keep batch normalization in training mode (batch statistics)
    #[arg(long)]
    pub train: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["cnnzoo", "run", "vgg11", "--batch", "4", "-s", "64"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.model.model.as_deref(), Some("vgg11"));
                assert_eq!(args.batch, 4);
                assert_eq!(args.size, 64);
                assert!(!args.train);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_model_or_config_required() {
        assert!(Cli::try_parse_from(["cnnzoo", "inspect"]).is_err());
        assert!(Cli::try_parse_from(["cnnzoo", "inspect", "--config", "m.json"]).is_ok());
        assert!(Cli::try_parse_from(["cnnzoo", "inspect", "vgg11", "--config", "m.json"]).is_err());
    }
}
