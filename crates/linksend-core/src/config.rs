//! 应用配置和持久化
//!
//! 提供设备名称、监听端口、下载目录等设置的存储和读取。

use std::fs;
use std::path::PathBuf;

use log::debug;
use serde::{Deserialize, Serialize};

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// 设备名称（握手时告知对端）
    pub device_name: String,
    /// 引擎监听端口（组主侧）
    pub listen_port: u16,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            listen_port: 8888,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            verbose: false,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("linksend");
        config_dir.join("settings.toml")
    }

    /// 加载设置（文件不存在或解析失败时使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Linksend".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert!(!settings.device_name.is_empty());
        assert_eq!(settings.listen_port, 8888);
        assert!(!settings.verbose);
    }

    #[test]
    fn test_settings_toml_roundtrip() {
        let settings = AppSettings {
            device_name: "test-device".to_string(),
            listen_port: 9000,
            download_dir: PathBuf::from("/tmp/downloads"),
            verbose: true,
        };

        let toml_str = toml::to_string_pretty(&settings).unwrap();
        let parsed: AppSettings = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.device_name, "test-device");
        assert_eq!(parsed.listen_port, 9000);
        assert_eq!(parsed.download_dir, PathBuf::from("/tmp/downloads"));
        assert!(parsed.verbose);
    }
}
