use crate::cli::{Cli, Commands, CommandsArgs, ContextArgs, OutputFormat, UseArgs};
use crate::config::Config;
use crate::context::{self, Context};
use crate::history::{EventCollector, EventType, Status};
use crate::registry::RegistryIndex;
use crate::resolver::{ResolveOptions, Resolver};
use crate::system::SystemDescriptor;
use color_eyre::eyre::{Result, eyre};
use console::Style;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Environment variables handed through into resolved contexts.
const ENVIRON_PASSTHROUGH: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "DISPLAY", "TERM", "XAUTHORITY", "HOSTNAME", "LANG",
    "TMPDIR",
];

pub fn execute(cli: Cli) -> Result<()> {
    let mut collector = EventCollector::new();
    collector.event(EventType::CommandStart);

    let (command, detail) = match &cli.command {
        Commands::Use(args) => ("use", run_use(args, &mut collector)),
        Commands::Context(args) => ("context", run_context(args)),
        Commands::Commands(args) => ("commands", run_commands(args, &mut collector)),
    };

    collector.event(EventType::CommandEnd);
    render(&cli, command, detail, collector)
}

/// What a command produced: a human summary for text mode and a payload
/// for the JSON envelope.
struct RenderDetail {
    status: Status,
    summary: String,
    detail: Value,
}

impl RenderDetail {
    fn ok(summary: impl Into<String>, detail: Value) -> Self {
        Self {
            status: Status::Ok,
            summary: summary.into(),
            detail,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: Status::Error,
            detail: json!({"error": message.clone()}),
            summary: message,
        }
    }
}

fn render(cli: &Cli, command: &str, detail: RenderDetail, collector: EventCollector) -> Result<()> {
    match cli.format {
        OutputFormat::Json => {
            let envelope = collector.build_envelope(
                format!("wiz {command}"),
                detail.status,
                detail.detail,
            );
            println!("{}", envelope.to_json_pretty());
            if detail.status == Status::Error {
                std::process::exit(1);
            }
            Ok(())
        }
        OutputFormat::Text => {
            if detail.status == Status::Error {
                return Err(eyre!(detail.summary));
            }
            for diagnostic in collector.diagnostics() {
                let tag = Style::new().yellow().apply_to(format!("{:?}", diagnostic.level));
                eprintln!("{}: {}", tag, diagnostic.message);
            }
            println!("{}", detail.summary);
            Ok(())
        }
    }
}

fn run_use(args: &UseArgs, collector: &mut EventCollector) -> RenderDetail {
    match resolve_context(args, collector) {
        Ok(context) => {
            let detail = match serde_json::to_value(&context) {
                Ok(value) => value,
                Err(err) => return RenderDetail::error(err.to_string()),
            };
            RenderDetail::ok(format_context(&context), detail)
        }
        Err(err) => RenderDetail::error(format!("{err:#}")),
    }
}

fn resolve_context(args: &UseArgs, collector: &mut EventCollector) -> Result<Context> {
    let config = Config::load()?;
    let registries: Vec<PathBuf> = if args.registries.is_empty() {
        config.registry_paths.clone()
    } else {
        args.registries.clone()
    };
    if registries.is_empty() {
        return Err(eyre!(
            "no registries configured; pass --registry or set WIZ_REGISTRY_PATHS"
        ));
    }

    let system = SystemDescriptor::current()?;
    let index = RegistryIndex::discover(&registries, &system, collector)?;

    let defaults = ResolveOptions::default();
    let options = ResolveOptions {
        max_attempts: args
            .max_attempts
            .or(config.max_attempts)
            .unwrap_or(defaults.max_attempts),
        max_combinations: args
            .max_combinations
            .or(config.max_combinations)
            .unwrap_or(defaults.max_combinations),
        include_implicit: if args.no_implicit {
            false
        } else {
            config.include_implicit.unwrap_or(defaults.include_implicit)
        },
        namespace_hints: defaults.namespace_hints,
    };

    let resolver = Resolver::new(&index, options);
    let context = resolver.resolve(&args.requests, &initial_environ(), collector)?;
    Ok(context)
}

fn initial_environ() -> BTreeMap<String, String> {
    ENVIRON_PASSTHROUGH
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
        .collect()
}

fn format_context(context: &Context) -> String {
    let heading = Style::new().bold();
    let mut out = String::new();
    out.push_str(&format!(
        "resolved {} package(s)\n\n",
        context.packages.len()
    ));

    out.push_str(&format!("{}\n", heading.apply_to("packages:")));
    for package in &context.packages {
        out.push_str(&format!(
            "  {}  ({})\n",
            package.qualified_identifier,
            package.definition_path.display()
        ));
    }

    if !context.command.is_empty() {
        out.push_str(&format!("\n{}\n", heading.apply_to("command:")));
        for (alias, target) in &context.command {
            out.push_str(&format!("  {alias} -> {target}\n"));
        }
    }

    out.push_str(&format!("\n{}\n", heading.apply_to("environ:")));
    for (key, value) in &context.environ {
        out.push_str(&format!("  {key}={value}\n"));
    }
    out.trim_end().to_string()
}

fn run_context(args: &ContextArgs) -> RenderDetail {
    let decoded = match &args.encoded {
        Some(encoded) => context::decode_context(encoded),
        None => context::discover_context(),
    };
    match decoded {
        Ok((registries, packages)) => {
            let mut out = String::new();
            out.push_str("registries:\n");
            for registry in &registries {
                out.push_str(&format!("  {}\n", registry.display()));
            }
            out.push_str("packages:\n");
            for package in &packages {
                out.push_str(&format!("  {package}\n"));
            }
            RenderDetail::ok(
                out.trim_end().to_string(),
                json!({"registries": registries, "packages": packages}),
            )
        }
        Err(err) => RenderDetail::error(err.to_string()),
    }
}

fn run_commands(args: &CommandsArgs, collector: &mut EventCollector) -> RenderDetail {
    let result = (|| -> Result<RegistryIndex> {
        let config = Config::load()?;
        let registries: Vec<PathBuf> = if args.registries.is_empty() {
            config.registry_paths.clone()
        } else {
            args.registries.clone()
        };
        if registries.is_empty() {
            return Err(eyre!(
                "no registries configured; pass --registry or set WIZ_REGISTRY_PATHS"
            ));
        }
        let system = SystemDescriptor::current()?;
        Ok(RegistryIndex::discover(&registries, &system, collector)?)
    })();

    match result {
        Ok(index) => {
            let mut out = String::new();
            for (alias, definition) in index.command_index() {
                out.push_str(&format!("{alias} -> {definition}\n"));
            }
            if out.is_empty() {
                out.push_str("no commands registered");
            }
            RenderDetail::ok(
                out.trim_end().to_string(),
                json!({"commands": index.command_index()}),
            )
        }
        Err(err) => RenderDetail::error(format!("{err:#}")),
    }
}
