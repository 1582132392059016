use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 视觉模型 API Key 的存取
pub trait CredentialStore: Send + Sync {
    /// 空字符串视为不存在
    fn get(&self) -> Option<String>;
    fn set(&self, api_key: &str) -> Result<()>;
}

/// 以 INI 文件保存凭证：`[vision] api_key = ...`
pub struct IniCredentialStore {
    path: PathBuf,
}

impl IniCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$HOME/.style-recon/credentials.ini`
    pub fn default_location() -> Option<Self> {
        env::var_os("HOME")
            .map(|home| Self::new(PathBuf::from(home).join(".style-recon").join("credentials.ini")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for IniCredentialStore {
    fn get(&self) -> Option<String> {
        if !self.path.exists() {
            return None;
        }
        let mut ini = configparser::ini::Ini::new();
        ini.load(&self.path).ok()?;
        ini.get("vision", "api_key")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn set(&self, api_key: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("创建凭证目录失败")?;
        }

        let mut ini = configparser::ini::Ini::new();
        if self.path.exists() {
            ini.load(&self.path)
                .map_err(|e| anyhow::anyhow!("读取凭证文件失败: {}: {}", self.path.display(), e))?;
        }
        ini.set("vision", "api_key", Some(api_key.trim().to_string()));
        ini.write(&self.path)
            .with_context(|| format!("写入凭证文件失败: {}", self.path.display()))?;
        Ok(())
    }
}

/// 内存中的凭证，不落盘
#[derive(Default)]
pub struct MemoryCredentialStore {
    api_key: Mutex<Option<String>>,
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<String> {
        self.api_key
            .lock()
            .ok()?
            .clone()
            .filter(|v| !v.is_empty())
    }

    fn set(&self, api_key: &str) -> Result<()> {
        let mut slot = self
            .api_key
            .lock()
            .map_err(|_| anyhow::anyhow!("凭证锁已损坏"))?;
        *slot = Some(api_key.trim().to_string());
        Ok(())
    }
}
