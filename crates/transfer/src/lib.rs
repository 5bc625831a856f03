//! Roundwork data transfer helpers.
//!
//! Phases exchange bulky payloads through files instead of the call envelope.
//! The orchestrator moves whatever a party writes to its transfer directory
//! into the base directory of the receiving side:
//!
//! | Sender | Writes to | Receiver reads from |
//! |--------|-----------|---------------------|
//! | local site | `<transferDirectory>/<key>.json` | remote: `<baseDirectory>/<siteId>/<key>.json` |
//! | remote | `<transferDirectory>/<key>.json` | every site: `<baseDirectory>/<key>.json` |
//!
//! [`send`] writes the payload and returns an output fragment `{key: "<file>"}`
//! that tells the receiver which file to load; [`recv`] and
//! [`recv_from_sites`] follow that reference. Payloads are JSON.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** All file I/O lives here; the [`pipeline`] crate only
//! sees [`pipeline::PhaseError::External`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use pipeline::{PhaseContext, PhaseError, PhaseOutput, SiteId};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Upper bound on concurrent per-site reads used by [`recv_from_sites`].
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Errors raised while exchanging payloads.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to write '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A payload could not be converted to JSON.
    #[error("could not encode payload '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A file exists but does not hold the expected payload.
    #[error("'{}' does not hold a valid payload: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The input does not say which file holds `key`.
    #[error("{origin} did not reference a file for '{key}'")]
    MissingReference {
        /// `"remote"` or `"site '<id>'"`.
        origin: String,
        key: String,
    },

    /// Keys and file references must be plain file names.
    #[error("'{name}' is not a plain file name")]
    InvalidName { name: String },

    #[error("could not start transfer worker pool: {0}")]
    Pool(String),
}

impl From<TransferError> for PhaseError {
    fn from(error: TransferError) -> Self {
        PhaseError::external(error)
    }
}

/// Writes `value` to `<transferDirectory>/<key>.json`.
///
/// Returns the fragment `{key: "<key>.json"}` for the phase to merge into its
/// output.
pub fn send<T: Serialize + ?Sized>(
    ctx: &PhaseContext<'_>,
    key: &str,
    value: &T,
) -> Result<PhaseOutput, TransferError> {
    let file = format!("{key}.json");
    ensure_plain_name(&file)?;
    let path = ctx.transfer_dir().join(&file);

    let bytes = serde_json::to_vec(value).map_err(|source| TransferError::Encode {
        key: key.to_string(),
        source,
    })?;
    fs::write(&path, bytes).map_err(|source| TransferError::Write {
        path: path.clone(),
        source,
    })?;
    tracing::debug!(key, path = %path.display(), "Sent transfer payload");

    Ok(PhaseOutput::new().with(key, file))
}

/// Local role: loads the payload the remote sent under `key`.
///
/// The file name is taken from `input[key]`; the file is read from the base
/// directory.
pub fn recv<T: DeserializeOwned>(ctx: &PhaseContext<'_>, key: &str) -> Result<T, TransferError> {
    let file = reference(ctx.input().get(key), key, || "remote".to_string())?;
    read_payload(&ctx.base_dir().join(file))
}

/// Remote role: loads every site's payload for `key`, in input order.
///
/// Reads run on a bounded pool of [`DEFAULT_MAX_WORKERS`] threads; the call
/// blocks until every read finished and fails if any single read failed.
pub fn recv_from_sites<T>(ctx: &PhaseContext<'_>, key: &str) -> Result<Vec<(SiteId, T)>, TransferError>
where
    T: DeserializeOwned + Send,
{
    recv_from_sites_with(ctx, key, DEFAULT_MAX_WORKERS)
}

/// [`recv_from_sites`] with an explicit worker bound.
pub fn recv_from_sites_with<T>(
    ctx: &PhaseContext<'_>,
    key: &str,
    max_workers: usize,
) -> Result<Vec<(SiteId, T)>, TransferError>
where
    T: DeserializeOwned + Send,
{
    let mut jobs = Vec::with_capacity(ctx.input().len());
    for (site, output) in ctx.input() {
        let origin = || format!("site '{site}'");
        let id = SiteId::new(site.as_str()).ok_or_else(|| TransferError::MissingReference {
            origin: origin(),
            key: key.to_string(),
        })?;
        let file = reference(output.get(key), key, origin)?;
        jobs.push((id, ctx.base_dir().join(site).join(file)));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_workers.max(1))
        .build()
        .map_err(|e| TransferError::Pool(e.to_string()))?;

    let loaded = pool.install(|| {
        jobs.into_par_iter()
            .map(|(site, path)| read_payload(&path).map(|payload| (site, payload)))
            .collect::<Result<Vec<_>, _>>()
    })?;
    tracing::debug!(key, sites = loaded.len(), "Received site transfer payloads");
    Ok(loaded)
}

fn reference<'v>(
    value: Option<&'v Value>,
    key: &str,
    origin: impl FnOnce() -> String,
) -> Result<&'v str, TransferError> {
    let file = value
        .and_then(Value::as_str)
        .ok_or_else(|| TransferError::MissingReference {
            origin: origin(),
            key: key.to_string(),
        })?;
    ensure_plain_name(file)?;
    Ok(file)
}

fn ensure_plain_name(name: &str) -> Result<(), TransferError> {
    let plain = Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
    if plain && name != "." && name != ".." {
        Ok(())
    } else {
        Err(TransferError::InvalidName {
            name: name.to_string(),
        })
    }
}

fn read_payload<T: DeserializeOwned>(path: &Path) -> Result<T, TransferError> {
    let bytes = fs::read(path).map_err(|source| TransferError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| TransferError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{CallState, Cache, PhaseName, Role};
    use serde_json::{json, Map};

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn state(base: &Path, transfer: &Path) -> CallState {
        CallState {
            base_directory: base.to_path_buf(),
            transfer_directory: transfer.to_path_buf(),
            ..CallState::default()
        }
    }

    #[test]
    fn test_send_writes_file_and_returns_reference() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), dir.path());
        let name = PhaseName::new("load").unwrap();
        let input = Map::new();
        let mut cache = Cache::new();
        let ctx = PhaseContext::new(&name, Role::Local, 0, &input, &state, &mut cache);

        let fragment = send(&ctx, "site_matrix", &vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(fragment.get("site_matrix"), Some(&json!("site_matrix.json")));
        let written = fs::read_to_string(dir.path().join("site_matrix.json")).unwrap();
        assert_eq!(written, "[[1.0,2.0],[3.0,4.0]]");
    }

    #[test]
    fn test_send_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), dir.path());
        let name = PhaseName::new("load").unwrap();
        let input = Map::new();
        let mut cache = Cache::new();
        let ctx = PhaseContext::new(&name, Role::Local, 0, &input, &state, &mut cache);

        assert!(matches!(
            send(&ctx, "../escape", &1),
            Err(TransferError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_local_recv_follows_reference() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("averaged.json"), "[2.0, 3.0]").unwrap();
        let state = state(dir.path(), dir.path());
        let name = PhaseName::new("save").unwrap();
        let input = object(json!({"averaged_matrix": "averaged.json"}));
        let mut cache = Cache::new();
        let ctx = PhaseContext::new(&name, Role::Local, 0, &input, &state, &mut cache);

        let averaged: Vec<f64> = recv(&ctx, "averaged_matrix").unwrap();
        assert_eq!(averaged, vec![2.0, 3.0]);
        assert!(matches!(
            recv::<Vec<f64>>(&ctx, "absent"),
            Err(TransferError::MissingReference { .. })
        ));
    }

    #[test]
    fn test_remote_recv_reads_every_site_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        for (site, payload) in [("site2", "[2]"), ("site1", "[1]"), ("site3", "[3]")] {
            fs::create_dir(dir.path().join(site)).unwrap();
            fs::write(dir.path().join(site).join("m.json"), payload).unwrap();
        }
        let state = state(dir.path(), dir.path());
        let name = PhaseName::new("aggregate").unwrap();
        let input = object(json!({
            "site2": {"m": "m.json"},
            "site1": {"m": "m.json"},
            "site3": {"m": "m.json"},
        }));
        let mut cache = Cache::new();
        let ctx = PhaseContext::new(&name, Role::Remote, 0, &input, &state, &mut cache);

        let loaded: Vec<(SiteId, Vec<u32>)> = recv_from_sites_with(&ctx, "m", 2).unwrap();
        let sites: Vec<&str> = loaded.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(sites, ["site2", "site1", "site3"]);
        assert_eq!(loaded[1].1, vec![1]);
    }

    #[test]
    fn test_one_failing_site_fails_the_whole_read() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("site1")).unwrap();
        fs::write(dir.path().join("site1").join("m.json"), "[1]").unwrap();
        let state = state(dir.path(), dir.path());
        let name = PhaseName::new("aggregate").unwrap();
        let input = object(json!({
            "site1": {"m": "m.json"},
            "site2": {"m": "m.json"},
        }));
        let mut cache = Cache::new();
        let ctx = PhaseContext::new(&name, Role::Remote, 0, &input, &state, &mut cache);

        let err = recv_from_sites::<Vec<u32>>(&ctx, "m").unwrap_err();
        assert!(matches!(err, TransferError::Read { ref path, .. } if path.ends_with("site2/m.json")));
        assert!(matches!(PhaseError::from(err), PhaseError::External(_)));
    }
}
