use crate::config::generate::generate_starter_config;
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let content = generate_starter_config();
    if stdout {
        print!("{}", content);
        return Ok(());
    }

    // Prefer the per-user location, fall back to the system one
    let config_path = dirs::home_dir()
        .map(|home| home.join(".config/cdcsink/config.yml"))
        .filter(|path| path.parent().map(|p| fs::create_dir_all(p).is_ok()).unwrap_or(false))
        .unwrap_or_else(|| PathBuf::from("/etc/cdcsink/config.yml"));

    if config_path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout",
            config_path.display()
        )
        .into());
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&config_path, content)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("no config file found; use --config to specify a path")?;
    println!("Validating config file: {}", path.display());

    crate::config::load_config(&path)?;
    println!("Config is valid");
    Ok(())
}
