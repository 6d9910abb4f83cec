//! Interface de linha de comando do aerorun baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (simulate, plan, demo,
//! status) e flags globais (--config, --verbose).

use std::path::PathBuf;

use aerorun::pipeline::Variant;
use clap::{Parser, Subcommand, ValueEnum};

/// aerorun — Orquestrador de simulações CFD em lote, sem supervisão.
#[derive(Debug, Parser)]
#[command(name = "aerorun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `aerorun.toml`).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Variante de pipeline aceita pela CLI, mapeada para [`Variant`] internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VariantArg {
    /// Asa dianteira, sem rodas.
    FrontWing,
    /// Asa traseira, sem rodas.
    RearWing,
    /// Assoalho com rodas girando.
    Undertray,
    /// Meio carro com plano de simetria e área frontal completa.
    HalfCar,
}

impl From<VariantArg> for Variant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::FrontWing => Variant::FrontWing,
            VariantArg::RearWing => Variant::RearWing,
            VariantArg::Undertray => Variant::Undertray,
            VariantArg::HalfCar => Variant::HalfCar,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enfileira os jobs de um arquivo TOML (`[[job]]`) ou JSON e executa o lote.
    Simulate {
        /// Arquivo com as definições de job.
        jobs_file: PathBuf,
    },

    /// Mostra a sequência de etapas e os parâmetros de uma variante.
    Plan {
        #[arg(value_enum)]
        variant: VariantArg,
    },

    /// Executa um lote de demonstração (asa dianteira, meio carro, assoalho).
    Demo,

    /// Mostra o resumo do lote gravado em `summary.csv`.
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_simulate_subcommand() {
        let cli = Cli::parse_from(["aerorun", "simulate", "jobs.toml"]);
        match cli.command {
            Command::Simulate { jobs_file } => {
                assert_eq!(jobs_file, PathBuf::from("jobs.toml"));
            }
            _ => panic!("expected Simulate command"),
        }
    }

    #[test]
    fn cli_parses_plan_variant() {
        let cli = Cli::parse_from(["aerorun", "plan", "half-car"]);
        match cli.command {
            Command::Plan { variant } => {
                assert_eq!(Variant::from(variant), Variant::HalfCar);
            }
            _ => panic!("expected Plan command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["aerorun", "--config", "custom.toml", "--verbose", "demo"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
