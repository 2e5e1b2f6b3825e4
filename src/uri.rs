//! Object URIs for masters and subarrays
//!
//! Remote locations follow `scheme://host/bucket/key-path`; anything without
//! a scheme is a local filesystem path. Wildcards `*` and `?` are accepted in
//! keys for read-only enumeration.

use std::fmt::{self, Display, Formatter};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A parsed master or subarray location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectUri {
    /// URI scheme (`s3`, `http`, ...); absent for local paths
    pub scheme: Option<String>,
    /// Endpoint host, for remote URIs
    pub host: Option<String>,
    /// Remote: `bucket/key-path`; local: the filesystem path
    pub path: String,
}

impl ObjectUri {
    /// Parse a URI string. Any string without `://` is a local path.
    pub fn parse(uri: &str) -> Self {
        match uri.split_once("://") {
            Some((scheme, rest)) => {
                let (host, path) = match rest.split_once('/') {
                    Some((host, path)) => (host.to_string(), path.to_string()),
                    None => (rest.to_string(), String::new()),
                };
                ObjectUri {
                    scheme: Some(scheme.to_string()),
                    host: Some(host),
                    path,
                }
            }
            None => ObjectUri {
                scheme: None,
                host: None,
                path: uri.to_string(),
            },
        }
    }

    /// Whether the URI names an object on a remote store.
    pub fn is_remote(&self) -> bool {
        self.scheme.is_some()
    }

    /// First segment of a remote path.
    pub fn bucket(&self) -> Option<&str> {
        if !self.is_remote() {
            return None;
        }
        Some(self.path.split('/').next().unwrap_or(""))
    }

    /// Remote path with the bucket stripped.
    pub fn key(&self) -> Option<&str> {
        if !self.is_remote() {
            return None;
        }
        Some(
            self.path
                .split_once('/')
                .map(|(_, key)| key)
                .unwrap_or(""),
        )
    }

    /// Whether the path contains listing wildcards.
    pub fn has_wildcards(&self) -> bool {
        self.path.contains('*') || self.path.contains('?')
    }

    /// The path with the final extension removed.
    fn base_path(&self) -> &str {
        match self.path.rfind('/') {
            Some(sep) => match self.path[sep..].rfind('.') {
                Some(dot) => &self.path[..sep + dot],
                None => &self.path,
            },
            None => self.path.rsplit_once('.').map(|(b, _)| b).unwrap_or(&self.path),
        }
    }

    /// The URI of one subarray of a variable of this master.
    ///
    /// Subarrays are colocated under the master's directory or key prefix:
    /// `{master_base}/{var}.{i.j.k}.{ext}`.
    pub fn subarray(&self, var_path: &str, index: &[usize], ext: &str) -> ObjectUri {
        let joined = index
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(".");
        let path = if joined.is_empty() {
            format!("{}/{}.{}", self.base_path(), var_path, ext)
        } else {
            format!("{}/{}.{}.{}", self.base_path(), var_path, joined, ext)
        };
        ObjectUri {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            path,
        }
    }

    /// A wildcard pattern matching every subarray of one variable.
    pub fn subarray_pattern(&self, var_path: &str, ext: &str) -> ObjectUri {
        ObjectUri {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            path: format!("{}/{}.*.{}", self.base_path(), var_path, ext),
        }
    }

    /// Compile the path's wildcards into an anchored matcher.
    pub fn wildcard_matcher(&self) -> Result<Regex> {
        let mut pattern = String::from("^");
        for c in self.path.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(&c.to_string())),
            }
        }
        pattern.push('$');
        Regex::new(&pattern)
            .map_err(|e| Error::InternalInvariant(format!("bad wildcard pattern: {e}")))
    }
}

impl Display for ObjectUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.scheme, &self.host) {
            (Some(scheme), Some(host)) => write!(f, "{}://{}/{}", scheme, host, self.path),
            _ => write!(f, "{}", self.path),
        }
    }
}

impl From<&str> for ObjectUri {
    fn from(uri: &str) -> Self {
        ObjectUri::parse(uri)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn remote_uri_splits_bucket_and_key() {
        let uri = ObjectUri::parse("s3://minio.example.com/weather/era5/master.nc");
        assert!(uri.is_remote());
        assert_eq!(uri.host.as_deref(), Some("minio.example.com"));
        assert_eq!(uri.bucket(), Some("weather"));
        assert_eq!(uri.key(), Some("era5/master.nc"));
        assert_eq!(
            uri.to_string(),
            "s3://minio.example.com/weather/era5/master.nc"
        );
    }

    #[test]
    fn local_path_has_no_scheme() {
        let uri = ObjectUri::parse("/data/era5/master.nc");
        assert!(!uri.is_remote());
        assert_eq!(uri.bucket(), None);
        assert_eq!(uri.to_string(), "/data/era5/master.nc");
    }

    #[test]
    fn subarray_names_follow_the_master_prefix() {
        let master = ObjectUri::parse("/data/era5/master.nc");
        let sub = master.subarray("t", &[0, 1], "nc");
        assert_eq!(sub.to_string(), "/data/era5/master/t.0.1.nc");

        let remote = ObjectUri::parse("s3://host/bucket/era5/master.nc");
        let sub = remote.subarray("t", &[2, 0], "nc");
        assert_eq!(sub.to_string(), "s3://host/bucket/era5/master/t.2.0.nc");
    }

    #[test]
    fn wildcards_match_whole_keys() {
        let pattern = ObjectUri::parse("/data/era5/master/t.*.nc");
        let re = pattern.wildcard_matcher().unwrap();
        assert!(re.is_match("/data/era5/master/t.0.0.nc"));
        assert!(re.is_match("/data/era5/master/t.11.3.nc"));
        assert!(!re.is_match("/data/era5/master/p.0.0.nc"));

        let q = ObjectUri::parse("/data/era5/master/t.?.0.nc");
        let re = q.wildcard_matcher().unwrap();
        assert!(re.is_match("/data/era5/master/t.4.0.nc"));
        assert!(!re.is_match("/data/era5/master/t.12.0.nc"));
    }
}
