//! Local host identity.
//!
//! Hosts register under their short hostname, so `mail3.example.com` and
//! `mail3` are the same host.

use crate::error::{Error, Result};

/// Short name of this machine, or the configured override.
pub fn local_host_name(configured: Option<&str>) -> Result<String> {
    if let Some(name) = configured {
        return Ok(short_host_name(name).to_string());
    }
    if let Ok(name) = std::env::var("HOSTNAME")
        && !name.trim().is_empty()
    {
        return Ok(short_host_name(name.trim()).to_string());
    }
    let raw = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .map_err(|e| Error::Config(format!("cannot determine host name: {e}")))?;
    let name = short_host_name(raw.trim());
    if name.is_empty() {
        return Err(Error::Config("host name is empty".into()));
    }
    Ok(name.to_string())
}

/// Strip the domain suffix from a host name.
pub fn short_host_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_domain() {
        assert_eq!(short_host_name("mail3.example.com"), "mail3");
        assert_eq!(short_host_name("mail3"), "mail3");
    }

    #[test]
    fn override_wins() {
        assert_eq!(local_host_name(Some("sort1.dc2")).unwrap(), "sort1");
    }
}
