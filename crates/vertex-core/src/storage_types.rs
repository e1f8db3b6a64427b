use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Storage provider kinds
///
/// This enum defines the available storage backend kinds.
/// It's defined in core because it's used in connection records and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    ObjectStorage,
    CloudDisk,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "object_storage" | "s3" | "minio" => Ok(ProviderKind::ObjectStorage),
            "cloud_disk" | "yandex_disk" => Ok(ProviderKind::CloudDisk),
            _ => Err(anyhow::anyhow!("Invalid provider kind: {}", s)),
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::ObjectStorage => write!(f, "object_storage"),
            ProviderKind::CloudDisk => write!(f, "cloud_disk"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("S3".parse::<ProviderKind>().unwrap(), ProviderKind::ObjectStorage);
        assert_eq!(
            "cloud_disk".parse::<ProviderKind>().unwrap(),
            ProviderKind::CloudDisk
        );
        assert!("nfs".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ProviderKind::ObjectStorage).unwrap();
        assert_eq!(json, "\"object_storage\"");
        let kind: ProviderKind = serde_json::from_str("\"cloud_disk\"").unwrap();
        assert_eq!(kind, ProviderKind::CloudDisk);
    }
}
