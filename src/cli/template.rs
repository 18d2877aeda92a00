use anyhow::{Context, Result};

const CONFIG_TEMPLATE: &str = include_str!("../../templates/simple-proxy.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", CONFIG_TEMPLATE);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfiguration;

    #[test]
    fn test_template_parses_as_configuration() {
        let config = ProxyConfiguration::from_toml(CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.listen_port, 8118);
        assert!(!config.forwarding_enabled);
        assert_eq!(config.target_proxy_host, "proxy.example.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_template_written_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.toml");
        generate_config_template(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CONFIG_TEMPLATE);
    }
}
