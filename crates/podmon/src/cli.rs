//! Command-line arguments

use clap::Parser;
use std::path::PathBuf;

/// Alert on pods whose containers exit with a non-zero code
#[derive(Debug, Default, Parser)]
#[command(name = "podmon")]
#[command(author, version, about = "Kubernetes pod failure monitor", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "PODMON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Namespace to watch; repeat for several namespaces
    #[arg(long = "namespace", short = 'n', value_name = "NAMESPACE")]
    pub namespaces: Vec<String>,

    /// Watch pods in every namespace
    #[arg(long, short = 'A', conflicts_with = "namespaces")]
    pub all_namespaces: bool,

    /// Annotation key prefix that opts a pod into alerting
    #[arg(long = "annotation", short = 'a', value_name = "PREFIX")]
    pub annotation_prefix: Option<String>,

    /// Path to kubeconfig file (in-cluster or default config if not specified)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Port for the health and metrics server
    #[arg(long)]
    pub api_port: Option<u16>,
}
