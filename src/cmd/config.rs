//! Configuration view and validation commands: `meetloop config`.

use std::path::Path;

use anyhow::Result;

use meetloop::config::{CONFIG_DIR, CONFIG_FILE, PanelConfig, PanelToml};

use super::super::ConfigCommands;

fn print_toml(toml: &PanelToml) {
    println!("[server]");
    println!("  base_url = \"{}\"", toml.server.base_url);
    println!("  connect_timeout_secs = {}", toml.server.connect_timeout_secs);
    println!();
    println!("[dispatch]");
    println!("  default_executor = \"{}\"", toml.dispatch.default_executor);
    println!("  title_match_len = {}", toml.dispatch.title_match_len);
    println!();
    println!("[verify]");
    println!("  synthetic_id_base = {}", toml.verify.synthetic_id_base);
    println!("  requirement_match_len = {}", toml.verify.requirement_match_len);
    println!();
    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  json = {}", toml.logging.json);
    println!();
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Meetloop Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_toml(&PanelToml::load(&config_path)?);
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!();
                println!("Using default configuration:");
                print_toml(&PanelToml::default());
                println!("Run 'meetloop config init' to create one.");
                println!();
            }

            println!("Effective values (with env overrides):");
            let config = PanelConfig::new(project_dir.to_path_buf())?;
            println!("  base_url = \"{}\"", config.server().base_url);
            println!("  default_executor = \"{}\"", config.default_executor());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let warnings = PanelToml::load(&config_path)?.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir)?;
            PanelToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] base_url, connect_timeout_secs");
            println!("  - [dispatch] default_executor (cloud, local, developer)");
            println!("  - [verify] synthetic_id_base");
            println!();
        }
    }

    Ok(())
}
