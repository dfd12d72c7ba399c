//! Subcommand implementations.

use std::io::{self, Write};
use std::time::Instant;

use cnnzoo_core::Tensor;
use cnnzoo_models::{ModelConfig, ModelKind, Network};
use cnnzoo_nn::{init, Layer};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use tracing::{debug, info};

use crate::cli::{InspectArgs, ModelArgs, RunArgs};

pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn resolve_config(args: &ModelArgs) -> CliResult<ModelConfig> {
    let config = match (&args.config, &args.model) {
        (Some(path), _) => {
            info!(path = %path.display(), "loading model configuration");
            ModelConfig::from_json_file(path)?
        }
        (None, Some(name)) => name.parse::<ModelKind>()?.config(),
        (None, None) => return Err("either a model name or --config is required".into()),
    };
    Ok(config)
}

fn build(args: &ModelArgs) -> CliResult<(ModelConfig, Network)> {
    let config = resolve_config(args)?;
    init::manual_seed(args.seed);
    let started = Instant::now();
    let net = config.build();
    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "model built");
    Ok((config, net))
}

fn heading(out: &mut impl Write, text: &str) -> io::Result<()> {
    execute!(
        out,
        SetForegroundColor(Color::Cyan),
        Print(format!("--- {} ---\n", text)),
        ResetColor
    )
}

fn key_value(out: &mut impl Write, key: &str, value: impl std::fmt::Display) -> io::Result<()> {
    execute!(
        out,
        SetForegroundColor(Color::DarkGrey),
        Print(format!("  {:<14}", key)),
        SetForegroundColor(Color::White),
        Print(format!("{}\n", value)),
        ResetColor
    )
}

/// Thousands separators: 11075754 -> 11,075,754
fn grouped(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn print_tree(
    out: &mut impl Write,
    layer: &dyn Layer,
    level: usize,
    max_depth: usize,
) -> io::Result<()> {
    for child in layer.children() {
        execute!(
            out,
            Print("  ".repeat(level + 1)),
            SetForegroundColor(Color::Green),
            Print(child.describe()),
            SetForegroundColor(Color::DarkGrey),
            Print(format!("  [{} params]\n", grouped(child.num_parameters()))),
            ResetColor
        )?;
        if level + 1 < max_depth {
            print_tree(out, child, level + 1, max_depth)?;
        }
    }
    Ok(())
}

pub fn inspect(args: &InspectArgs, out: &mut impl Write) -> CliResult<()> {
    let (config, net) = build(&args.model)?;

    if args.json {
        writeln!(out, "{}", config.to_json_pretty()?)?;
        return Ok(());
    }

    let input = vec![1, config.image_channels(), args.size, args.size];
    heading(out, &net.describe())?;
    key_value(out, "architecture", net.arch())?;
    key_value(out, "parameters", grouped(net.num_parameters()))?;
    key_value(out, "input", format!("{:?}", input))?;

    // top-level children of both architectures form a chain
    let mut shape = input;
    for child in net.children() {
        shape = child.output_shape(&shape)?;
        key_value(out, "->", format!("{:?}  {}", shape, child.describe()))?;
    }

    if args.depth > 0 {
        heading(out, "layers")?;
        print_tree(out, &net, 0, args.depth)?;
    }
    Ok(())
}

pub fn run(args: &RunArgs, out: &mut impl Write) -> CliResult<()> {
    let (config, mut net) = build(&args.model)?;
    if args.train {
        net.train();
    } else {
        net.eval();
    }

    let shape = vec![args.batch, config.image_channels(), args.size, args.size];
    let expected = net.output_shape(&shape)?;
    let images: Tensor<f32> = Tensor::randn(shape.clone(), Some(args.input_seed));

    info!(model = %net.describe(), input = ?shape, "running forward pass");
    let started = Instant::now();
    let logits = net.forward(&images)?;
    let elapsed = started.elapsed();
    debug_assert_eq!(logits.shape_vec(), expected);

    heading(out, "forward")?;
    key_value(out, "input", format!("{:?}", shape))?;
    key_value(out, "logits", format!("{:?}", logits.shape_vec()))?;
    key_value(out, "elapsed", format!("{:.1?}", elapsed))?;
    key_value(out, "mode", if args.train { "train" } else { "eval" })?;

    let classes = net.num_classes();
    let predictions = logits.argmax_rows()?;
    for (i, (row, class)) in logits.data().chunks(classes).zip(predictions).enumerate() {
        execute!(
            out,
            SetForegroundColor(Color::Yellow),
            Print(format!("  image {:<4} class {:<4}", i, class)),
            SetForegroundColor(Color::DarkGrey),
            Print(format!("score {:+.4}\n", row[class])),
            ResetColor
        )?;
    }
    Ok(())
}

pub fn list(out: &mut impl Write) -> CliResult<()> {
    heading(out, "presets")?;
    for kind in ModelKind::ALL {
        let config = kind.config();
        let summary = format!(
            "{} classes, {}-channel input",
            config.num_classes(),
            config.image_channels()
        );
        key_value(out, kind.name(), summary)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use clap::Parser;

    use crate::cli::{Cli, Commands};

    // Builds reset the process-wide init seed; keep them from interleaving.
    static BUILD_LOCK: Mutex<()> = Mutex::new(());

    const TINY_VGG: &str = r#"{"arch": "vgg", "stages": [4, "M"], "num_classes": 3}"#;

    fn write_config(name: &str, json: &str) -> PathBuf {
        let file = format!("cnnzoo-{}-{}.json", name, std::process::id());
        let path = std::env::temp_dir().join(file);
        std::fs::write(&path, json).unwrap();
        path
    }

    fn parse(args: &[&str]) -> Commands {
        Cli::parse_from(std::iter::once("cnnzoo").chain(args.iter().copied())).command
    }

    fn captured(f: impl FnOnce(&mut Vec<u8>) -> CliResult<()>) -> String {
        let _guard = BUILD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn run_tiny(path: &Path, extra: &[&str]) -> String {
        let config = path.to_str().unwrap();
        let mut argv = vec!["run", "--config", config, "--batch", "2", "--size", "4"];
        argv.extend_from_slice(extra);
        match parse(&argv) {
            Commands::Run(args) => captured(|out| run(&args, out)),
            other => panic!("expected run, got {other:?}"),
        }
    }

    fn model_args(model: Option<&str>, config: Option<PathBuf>) -> ModelArgs {
        ModelArgs {
            model: model.map(str::to_string),
            config,
            seed: 1,
        }
    }

    #[test]
    fn test_grouped() {
        assert_eq!(grouped(0), "0");
        assert_eq!(grouped(999), "999");
        assert_eq!(grouped(1000), "1,000");
        assert_eq!(grouped(11_075_754), "11,075,754");
    }

    #[test]
    fn test_resolve_preset_and_unknown() {
        assert_eq!(
            resolve_config(&model_args(Some("vgg16"), None)).unwrap(),
            ModelKind::Vgg16.config()
        );
        assert!(resolve_config(&model_args(Some("vgg12"), None)).is_err());
        assert!(resolve_config(&model_args(None, None)).is_err());
    }

    #[test]
    fn test_resolve_config_file() {
        let path = std::env::temp_dir().join(format!("cnnzoo-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"arch": "vgg", "stages": [4, "M"], "num_classes": 2}"#).unwrap();
        let config = resolve_config(&model_args(None, Some(path.clone()))).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.num_classes(), 2);
    }

    #[test]
    fn test_build_is_reproducible_under_seed() {
        let _guard = BUILD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let args = model_args(Some("vgg11"), None);
        let (_, a) = build(&args).unwrap();
        let (_, b) = build(&args).unwrap();
        let first = |n: &Network| n.parameters()[0].data.data()[..8].to_vec();
        assert_eq!(first(&a), first(&b));
    }

    #[test]
    fn test_inspect_prints_shape_chain() {
        let path = write_config("inspect", TINY_VGG);
        let config = path.to_str().unwrap();
        let text = match parse(&["inspect", "--config", config, "--size", "4"]) {
            Commands::Inspect(args) => captured(|out| inspect(&args, out)),
            other => panic!("expected inspect, got {other:?}"),
        };
        std::fs::remove_file(&path).unwrap();

        assert!(text.contains("vgg"));
        // features: conv keeps 4x4, the pool halves it; head: 3 classes
        assert!(text.contains("[1, 4, 2, 2]"));
        assert!(text.contains("[1, 3]"));
        assert!(text.contains("ConvBlock(3, 4)"));
    }

    #[test]
    fn test_inspect_json_round_trips() {
        let path = write_config("inspect-json", TINY_VGG);
        let config = path.to_str().unwrap();
        let text = match parse(&["inspect", "--config", config, "--json"]) {
            Commands::Inspect(args) => captured(|out| inspect(&args, out)),
            other => panic!("expected inspect, got {other:?}"),
        };
        std::fs::remove_file(&path).unwrap();

        let parsed = ModelConfig::from_json_str(&text).unwrap();
        assert_eq!(parsed, ModelConfig::from_json_str(TINY_VGG).unwrap());
    }

    #[test]
    fn test_run_eval_and_train() {
        let path = write_config("run", TINY_VGG);
        let eval = run_tiny(&path, &[]);
        let train = run_tiny(&path, &["--train"]);
        std::fs::remove_file(&path).unwrap();

        for (text, mode) in [(&eval, "eval"), (&train, "train")] {
            assert!(text.contains(mode));
            assert!(text.contains("[2, 3]"));
            assert!(text.contains("image 0"));
            assert!(text.contains("image 1"));
            assert!(!text.contains("image 2"));
        }
    }

    #[test]
    fn test_run_is_repeatable_in_eval() {
        let path = write_config("run-repeat", TINY_VGG);
        let score_lines = |text: String| -> Vec<String> {
            text.lines().filter(|l| l.contains("image")).map(str::to_string).collect()
        };
        let a = score_lines(run_tiny(&path, &[]));
        let b = score_lines(run_tiny(&path, &[]));
        std::fs::remove_file(&path).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_list_names_every_preset() {
        let text = captured(|out| list(out));
        for kind in ModelKind::ALL {
            assert!(text.contains(kind.name()));
        }
    }
}
