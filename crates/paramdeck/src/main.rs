//! paramdeck command-line client.
//!
//! Previews, evaluates and creates workspaces against a deployment's
//! dynamic parameter service.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use paramdeck_telemetry::{LogFormat, Telemetry, TelemetryConfig};
use uuid::Uuid;

use paramdeck_lib::api::Workspace;
use paramdeck_lib::autofill::{self, AutofillParameter};
use paramdeck_lib::flow::{FlowOptions, PageQuery, ME};
use paramdeck_lib::protocol::{Diagnostic, Inputs, PreviewParameter};
use paramdeck_lib::{
    ApiClient, ClientConfig, ClientError, CreateWorkspaceFlow, CreateWorkspaceMode, DynamicParameterClient,
};

#[derive(Parser, Debug)]
#[command(name = "paramdeck", about = "Dynamic parameter client for workspace templates", version)]
struct Cli {
    /// Deployment URL.
    #[arg(long, env = "PARAMDECK_URL", global = true)]
    url: Option<String>,

    /// Session token.
    #[arg(long, env = "PARAMDECK_SESSION_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Evaluation WebSocket base, when it differs from the deployment URL.
    #[arg(long, global = true)]
    websocket_url: Option<String>,

    /// Log level.
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Log format (pretty or json).
    #[arg(long, env = "PARAMDECK_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: String,

    /// Print Prometheus metrics to stderr on exit.
    #[arg(long, global = true)]
    metrics: bool,

    /// Output format (text or json).
    #[arg(long, default_value = "text", global = true)]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct TemplateArgs {
    /// Organization name.
    #[arg(long, default_value = "default")]
    org: String,

    /// Template name.
    #[arg(long)]
    template: String,

    /// Template version name or id (default: active version).
    #[arg(long)]
    version: Option<String>,

    /// Owner username (default: the current user).
    #[arg(long)]
    owner: Option<String>,

    /// Parameter value, `name=value`. Repeatable.
    #[arg(long = "param", short = 'p')]
    params: Vec<String>,

    /// YAML file of parameter values.
    #[arg(long)]
    values_file: Option<PathBuf>,

    /// Query string of a create-workspace link (`param.x=y&mode=auto`).
    #[arg(long)]
    url_query: Option<String>,

    /// Preset to select by name.
    #[arg(long)]
    preset: Option<String>,

    /// Ignore values from earlier builds.
    #[arg(long)]
    no_history: bool,

    /// Seconds to wait for the evaluation service.
    #[arg(long, default_value = "30")]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the evaluated parameters of a template.
    Preview {
        #[command(flatten)]
        template: TemplateArgs,

        /// Edit applied after the initial evaluation, `name=value`.
        /// Repeatable; applied in order.
        #[arg(long = "set")]
        sets: Vec<String>,
    },

    /// Evaluate parameter values once, without a live connection.
    Evaluate {
        /// Template version id.
        #[arg(long)]
        version: Uuid,

        /// Owner username or id (default: the current user).
        #[arg(long)]
        owner: Option<String>,

        /// Parameter value, `name=value`. Repeatable.
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,

        /// YAML file of parameter values.
        #[arg(long)]
        values_file: Option<PathBuf>,
    },

    /// Create a workspace.
    Create {
        #[command(flatten)]
        template: TemplateArgs,

        /// Workspace name (default: a generated name).
        #[arg(long)]
        name: Option<String>,

        /// Create straight from the supplied values when possible.
        #[arg(long)]
        auto: bool,

        /// Copy values from an existing workspace (`name` or `owner/name`).
        #[arg(long)]
        duplicate: Option<String>,

        /// Wait for missing external auth instead of failing.
        #[arg(long)]
        wait_external_auth: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_format = match cli.log_format.parse::<LogFormat>() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    let output = match cli.output.as_str() {
        "text" => Output::Text,
        "json" => Output::Json,
        other => {
            eprintln!("error: unknown output format {other:?}, expected text or json");
            return ExitCode::from(2);
        }
    };

    let config = TelemetryConfig::new()
        .with_log_level(cli.log_level.clone())
        .with_log_format(log_format);
    let telemetry = match Telemetry::init(config) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = run(&cli, &telemetry, output).await;

    if cli.metrics {
        eprint!("{}", telemetry.render_prometheus());
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            if let ClientError::Api { detail: Some(detail), .. } = &e {
                eprintln!("  {}", detail);
            }
            ExitCode::from(if e.is_usage() { 2 } else { 1 })
        }
    }
}

async fn run(cli: &Cli, telemetry: &Telemetry, output: Output) -> Result<(), ClientError> {
    let config = client_config(cli)?;
    let api = ApiClient::new(config.clone())?;
    let client = DynamicParameterClient::new(config).with_metrics(telemetry.metrics_clone());

    match &cli.command {
        Commands::Preview { template, sets } => {
            let edits = parse_edits(sets)?;
            let flow = CreateWorkspaceFlow::new(api, client);
            run_preview(&flow, template, &edits, output).await
        }
        Commands::Evaluate {
            version,
            owner,
            params,
            values_file,
        } => run_evaluate(&api, *version, owner.as_deref(), params, values_file.as_deref(), output).await,
        Commands::Create {
            template,
            name,
            auto,
            duplicate,
            wait_external_auth,
        } => {
            let mut options = flow_options(template)?;
            options.name = name.clone().or(options.name);
            if *auto {
                options.mode = CreateWorkspaceMode::Auto;
            }
            options.duplicate_from = duplicate.clone();
            options.wait_for_external_auth = *wait_external_auth;

            let flow = CreateWorkspaceFlow::new(api, client);
            let workspace = flow.run(&options).await?;
            print_workspace(&workspace, output)
        }
    }
}

fn client_config(cli: &Cli) -> Result<ClientConfig, ClientError> {
    let url = cli
        .url
        .as_deref()
        .ok_or_else(|| ClientError::Config("no deployment url, pass --url or set PARAMDECK_URL".to_string()))?;

    let mut config = ClientConfig::new(url)?;
    if let Some(token) = &cli.token {
        config = config.with_session_token(token.clone());
    }
    if let Some(ws) = &cli.websocket_url {
        config = config.with_websocket_url(ws)?;
    }
    Ok(config)
}

/// Values from the file, then the link, then flags.
fn collect_autofill(
    params: &[String],
    values_file: Option<&std::path::Path>,
) -> Result<Vec<AutofillParameter>, ClientError> {
    let mut values = Vec::new();
    if let Some(path) = values_file {
        values.extend(autofill::from_values_file(path)?);
    }
    values.extend(autofill::from_flags(params)?);
    Ok(autofill::merge(values))
}

fn flow_options(args: &TemplateArgs) -> Result<FlowOptions, ClientError> {
    let mut options = FlowOptions::new(args.org.clone(), args.template.clone());
    options.version = args.version.clone();
    options.owner = args.owner.clone();
    options.preset = args.preset.clone();
    options.use_history = !args.no_history;
    options.ready_timeout = Duration::from_secs(args.timeout);
    options.autofill = collect_autofill(&args.params, args.values_file.as_deref())?;

    if let Some(query) = &args.url_query {
        PageQuery::parse(query)?.apply_to(&mut options);
    }
    Ok(options)
}

fn parse_edits(sets: &[String]) -> Result<Vec<(String, String)>, ClientError> {
    autofill::from_flags(sets).map(|values| values.into_iter().map(|v| (v.name, v.value)).collect())
}

async fn run_preview(
    flow: &CreateWorkspaceFlow,
    args: &TemplateArgs,
    edits: &[(String, String)],
    output: Output,
) -> Result<(), ClientError> {
    let options = flow_options(args)?;
    let prepared = flow.prepare(&options).await?;
    let (mut session, mut form) = flow.open(&prepared, &options)?;

    let result = async {
        flow.settle(&mut session, &mut form, options.ready_timeout).await?;
        flow.edit(&session, &mut form, edits, options.ready_timeout).await
    }
    .await;
    session.close();
    let view = result?;

    print_parameters(&view.parameters, &view.inputs, &view.diagnostics, output)
}

async fn run_evaluate(
    api: &ApiClient,
    version: Uuid,
    owner: Option<&str>,
    params: &[String],
    values_file: Option<&std::path::Path>,
    output: Output,
) -> Result<(), ClientError> {
    let owner_id = match owner {
        None | Some(ME) => api.current_user().await?.id,
        Some(owner) => match Uuid::parse_str(owner) {
            Ok(id) => id,
            Err(_) => api.user(owner).await?.id,
        },
    };

    let inputs: Inputs = collect_autofill(params, values_file)?
        .into_iter()
        .map(|p| (p.name, p.value))
        .collect();

    let response = api.evaluate(version, owner_id, inputs.clone()).await?;
    print_parameters(&response.parameters, &inputs, &response.diagnostics, output)
}

fn print_parameters(
    parameters: &[PreviewParameter],
    inputs: &Inputs,
    diagnostics: &[Diagnostic],
    output: Output,
) -> Result<(), ClientError> {
    if output == Output::Json {
        let json = serde_json::json!({
            "parameters": parameters,
            "inputs": inputs,
            "diagnostics": diagnostics,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    for parameter in parameters {
        let value = inputs
            .get(&parameter.name)
            .map(String::as_str)
            .unwrap_or_else(|| parameter.value.valid_value());
        let mut flags = Vec::new();
        if parameter.required {
            flags.push("required");
        }
        if parameter.ephemeral {
            flags.push("ephemeral");
        }
        if !parameter.mutable {
            flags.push("immutable");
        }

        println!(
            "{:<24} {:<14} {}{}",
            parameter.name,
            parameter.param_type.as_str(),
            value,
            if flags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", flags.join(", "))
            }
        );
        for diagnostic in &parameter.diagnostics {
            println!("  {}", describe(diagnostic));
        }
    }

    for diagnostic in diagnostics {
        println!("{}", describe(diagnostic));
    }
    Ok(())
}

fn describe(diagnostic: &Diagnostic) -> String {
    let severity = if diagnostic.is_error() { "error" } else { "warning" };
    if diagnostic.detail.is_empty() {
        format!("{severity}: {}", diagnostic.summary)
    } else {
        format!("{severity}: {}: {}", diagnostic.summary, diagnostic.detail)
    }
}

fn print_workspace(workspace: &Workspace, output: Output) -> Result<(), ClientError> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(workspace)?),
        Output::Text => {
            let owner = if workspace.owner_name.is_empty() {
                workspace.owner_id.to_string()
            } else {
                workspace.owner_name.clone()
            };
            match workspace.created_at {
                Some(created) => println!(
                    "created workspace {}/{} ({}) at {}",
                    owner,
                    workspace.name,
                    workspace.id,
                    created.to_rfc3339()
                ),
                None => println!("created workspace {}/{} ({})", owner, workspace.name, workspace.id),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_create() {
        let cli = Cli::try_parse_from([
            "paramdeck",
            "--url",
            "https://dev.example.com",
            "create",
            "--template",
            "docker",
            "--param",
            "region=eu-west",
            "-p",
            "cpu_count=4",
            "--auto",
        ])
        .unwrap();

        match cli.command {
            Commands::Create { template, auto, .. } => {
                assert_eq!(template.org, "default");
                assert_eq!(template.params.len(), 2);
                assert!(auto);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_flags_override_link_values() {
        let cli = Cli::try_parse_from([
            "paramdeck",
            "preview",
            "--template",
            "docker",
            "--param",
            "region=us-east",
            "--url-query",
            "param.region=eu-west&param.image=ubuntu&mode=auto",
        ])
        .unwrap();

        let Commands::Preview { template, .. } = cli.command else {
            panic!("expected preview");
        };
        let options = flow_options(&template).unwrap();
        let region = options.autofill.iter().find(|p| p.name == "region").unwrap();
        assert_eq!(region.value, "us-east");
        assert_eq!(options.mode, CreateWorkspaceMode::Auto);
    }

    #[test]
    fn test_missing_url_is_usage_error() {
        let cli = Cli::try_parse_from(["paramdeck", "preview", "--template", "docker"]).unwrap();
        let err = client_config(&Cli { url: None, ..cli }).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn test_parse_edits() {
        let edits = parse_edits(&["cpu_count=8".to_string()]).unwrap();
        assert_eq!(edits, vec![("cpu_count".to_string(), "8".to_string())]);
        assert!(parse_edits(&["cpu_count".to_string()]).is_err());
    }
}
