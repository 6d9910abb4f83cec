//! Configuração do aerorun carregada a partir de `aerorun.toml`.
//!
//! A struct [`AeroConfig`] contém todos os valores de política lidos pelas
//! definições de pipeline e pelo controlador de rampa. Valores não presentes
//! no arquivo usam defaults sensíveis. A variável de ambiente
//! `AERORUN_OUTPUT_ROOT` tem precedência sobre o arquivo.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::AeroError;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "aerorun.toml";

/// Configuração de nível superior carregada de `aerorun.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AeroConfig {
    /// Diretório raiz dos resultados; cada job grava em `<output_root>/<nome>`.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    #[serde(default)]
    pub meshing: MeshingConfig,

    #[serde(default)]
    pub ramp: RampConfig,

    #[serde(default)]
    pub physics: PhysicsConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Parâmetros de malha: camadas de contorno e limites de célula.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshingConfig {
    #[serde(default = "default_bl_layers")]
    pub bl_layers: u32,
    #[serde(default = "default_bl_growth")]
    pub bl_growth: f64,
    #[serde(default = "default_first_layer_height")]
    pub first_layer_height: f64,
    #[serde(default = "default_min_cell_length")]
    pub min_cell_length: f64,
    #[serde(default = "default_max_cell_length")]
    pub max_cell_length: f64,
}

/// Política da rampa do solver e critério de convergência.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Iterações alvo das três sub-etapas da rampa.
    #[serde(default = "default_ramp_iterations")]
    pub iterations: [u64; 3],
    /// Resíduo de continuidade abaixo do qual a solução é considerada convergida.
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    /// Resíduo de continuidade acima do qual a solução é considerada divergente.
    #[serde(default = "default_divergence_residual")]
    pub divergence_residual: f64,
    /// Quantos reinícios automáticos uma divergência pode disparar por job.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_relaxation")]
    pub relaxation: f64,
    #[serde(default = "default_courant")]
    pub courant: f64,
    #[serde(default = "default_restart_relaxation")]
    pub restart_relaxation: f64,
    #[serde(default = "default_restart_courant")]
    pub restart_courant: f64,
}

/// Condições físicas do carro.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsConfig {
    /// Velocidade de rotação das rodas (rad/s), de 8 pol. de raio a 40 mph.
    #[serde(default = "default_wheel_omega")]
    pub wheel_omega_rad_s: f64,
    /// Velocidade de entrada e do solo móvel (mph).
    #[serde(default = "default_inlet_speed")]
    pub inlet_speed_mph: f64,
}

/// Parâmetros da sessão do motor externo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_processor_count")]
    pub processor_count: usize,
    /// Retentativas locais de um comando que falhou de forma recuperável.
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("aero-results")
}

fn default_bl_layers() -> u32 {
    10
}

fn default_bl_growth() -> f64 {
    1.2
}

fn default_first_layer_height() -> f64 {
    0.0005
}

fn default_min_cell_length() -> f64 {
    0.0005
}

fn default_max_cell_length() -> f64 {
    0.256
}

fn default_ramp_iterations() -> [u64; 3] {
    [1000, 1000, 5000]
}

fn default_convergence_threshold() -> f64 {
    1e-4
}

fn default_divergence_residual() -> f64 {
    1.0
}

fn default_max_restarts() -> u32 {
    1
}

fn default_relaxation() -> f64 {
    0.5
}

fn default_courant() -> f64 {
    20.0
}

fn default_restart_relaxation() -> f64 {
    0.1
}

fn default_restart_courant() -> f64 {
    1.0
}

fn default_wheel_omega() -> f64 {
    88.0
}

fn default_inlet_speed() -> f64 {
    40.0
}

// Usa todos os núcleos disponíveis no host; 1 se não for possível detectar.
fn default_processor_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_command_retries() -> u32 {
    1
}

impl Default for MeshingConfig {
    fn default() -> Self {
        Self {
            bl_layers: default_bl_layers(),
            bl_growth: default_bl_growth(),
            first_layer_height: default_first_layer_height(),
            min_cell_length: default_min_cell_length(),
            max_cell_length: default_max_cell_length(),
        }
    }
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            iterations: default_ramp_iterations(),
            convergence_threshold: default_convergence_threshold(),
            divergence_residual: default_divergence_residual(),
            max_restarts: default_max_restarts(),
            relaxation: default_relaxation(),
            courant: default_courant(),
            restart_relaxation: default_restart_relaxation(),
            restart_courant: default_restart_courant(),
        }
    }
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            wheel_omega_rad_s: default_wheel_omega(),
            inlet_speed_mph: default_inlet_speed(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processor_count: default_processor_count(),
            command_retries: default_command_retries(),
        }
    }
}

impl Default for AeroConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            meshing: MeshingConfig::default(),
            ramp: RampConfig::default(),
            physics: PhysicsConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AeroConfig {
    /// Carrega a configuração de `aerorun.toml` no diretório atual.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração do caminho fornecido.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<AeroConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o diretório de saída.
        if let Ok(root) = std::env::var("AERORUN_OUTPUT_ROOT")
            && !root.is_empty()
        {
            config.output_root = PathBuf::from(root);
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita valores de política que tornariam a máquina de estados sem sentido.
    pub fn validate(&self) -> Result<(), AeroError> {
        if self.ramp.iterations.contains(&0) {
            return Err(AeroError::Config(
                "ramp iteration targets must be positive".into(),
            ));
        }
        let threshold = self.ramp.convergence_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(AeroError::Config(format!(
                "convergence threshold {threshold} must lie in (0, 1)"
            )));
        }
        if self.ramp.divergence_residual <= threshold {
            return Err(AeroError::Config(
                "divergence residual must exceed the convergence threshold".into(),
            ));
        }
        if self.meshing.bl_layers == 0 {
            return Err(AeroError::Config("bl_layers must be at least 1".into()));
        }
        if self.meshing.bl_growth <= 1.0 {
            return Err(AeroError::Config(format!(
                "bl_growth {} must be greater than 1.0",
                self.meshing.bl_growth
            )));
        }
        if self.physics.inlet_speed_mph <= 0.0 || self.physics.wheel_omega_rad_s <= 0.0 {
            return Err(AeroError::Config("speeds must be positive".into()));
        }
        if self.engine.processor_count == 0 {
            return Err(AeroError::Config("processor_count must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = AeroConfig::default();
        assert_eq!(config.meshing.bl_layers, 10);
        assert_eq!(config.meshing.bl_growth, 1.2);
        assert_eq!(config.ramp.iterations, [1000, 1000, 5000]);
        assert_eq!(config.ramp.convergence_threshold, 1e-4);
        assert_eq!(config.ramp.max_restarts, 1);
        assert_eq!(config.physics.wheel_omega_rad_s, 88.0);
        assert_eq!(config.physics.inlet_speed_mph, 40.0);
        assert_eq!(config.engine.command_retries, 1);
        assert!(config.engine.processor_count >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            output_root = "/tmp/results"

            [ramp]
            iterations = [200, 300, 400]

            [meshing]
            bl_layers = 14
        "#;
        let config: AeroConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.output_root, PathBuf::from("/tmp/results"));
        assert_eq!(config.ramp.iterations, [200, 300, 400]);
        assert_eq!(config.ramp.convergence_threshold, 1e-4);
        assert_eq!(config.meshing.bl_layers, 14);
        assert_eq!(config.meshing.bl_growth, 1.2);
        assert_eq!(config.physics.inlet_speed_mph, 40.0);
    }

    #[test]
    fn validate_rejects_zero_iterations() {
        let mut config = AeroConfig::default();
        config.ramp.iterations = [1000, 0, 5000];
        assert!(matches!(config.validate(), Err(AeroError::Config(_))));
    }

    #[test]
    fn validate_rejects_bad_growth_and_threshold() {
        let mut config = AeroConfig::default();
        config.meshing.bl_growth = 1.0;
        assert!(config.validate().is_err());

        let mut config = AeroConfig::default();
        config.ramp.convergence_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AeroConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.ramp.max_restarts, 1);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[physics]\nwheel_omega_rad_s = 90.0\n").unwrap();
        let config = AeroConfig::load_from(&path).unwrap();
        assert_eq!(config.physics.wheel_omega_rad_s, 90.0);
    }
}
