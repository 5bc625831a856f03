//! Human-readable debug record of every call.
//!
//! Enabled through [`crate::NodeOptions::debug_log`]. Each call appends one
//! block to `<outputDirectory>/<ROLE>_<clientId>_logs.txt`:
//!
//! ```text
//! [INPUT] 14:05:07 03/09/2024
//!   ->{"data":[1,2,3]}
//! [CACHE] 14:05:07 03/09/2024
//!   ->{}
//!   <-{"input_args":{...},"PHASE:load":true,...}
//! [OUTPUT] 14:05:07 03/09/2024
//!   <-{"output":{...},"cache":{...}}
//! ```

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use pipeline::{CallResponse, CallState, Cache, Role, Timestamp};
use serde_json::{Map, Value};

/// What one call saw and produced.
pub struct CallRecord<'a> {
    pub input: &'a Map<String, Value>,
    pub cache_before: &'a Cache,
    pub response: &'a CallResponse,
}

/// Location of the debug log for `role` and the state's client id.
pub fn log_path(state: &CallState, role: Role) -> PathBuf {
    state
        .output_directory
        .join(format!("{role}_{}_logs.txt", state.client_id))
}

/// Appends `record` to the role's log file, creating it if needed.
pub fn append(state: &CallState, role: Role, record: &CallRecord<'_>) -> io::Result<()> {
    let path = log_path(state, role);
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    let at = Timestamp::now().to_log_string();

    let input = serde_json::to_string(record.input)?;
    let before = serde_json::to_string(record.cache_before)?;
    let after = serde_json::to_string(&record.response.cache)?;
    let output = serde_json::to_string(record.response)?;

    writeln!(file, "[INPUT] {at}")?;
    writeln!(file, "  ->{input}")?;
    writeln!(file, "[CACHE] {at}")?;
    writeln!(file, "  ->{before}")?;
    writeln!(file, "  <-{after}")?;
    writeln!(file, "[OUTPUT] {at}")?;
    writeln!(file, "  <-{output}")?;
    writeln!(file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_path_uses_role_and_client() {
        let state = CallState {
            output_directory: PathBuf::from("/out"),
            client_id: "site3".into(),
            ..CallState::default()
        };
        assert_eq!(
            log_path(&state, Role::Local),
            PathBuf::from("/out/LOCAL_site3_logs.txt")
        );
    }

    #[test]
    fn test_append_accumulates_records() {
        let dir = tempfile::tempdir().unwrap();
        let state = CallState {
            output_directory: dir.path().to_path_buf(),
            client_id: "remote".into(),
            ..CallState::default()
        };
        let input = match json!({"site1": {"vote": true}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let response = CallResponse {
            success: Some(false),
            ..CallResponse::default()
        };
        let record = CallRecord {
            input: &input,
            cache_before: &Cache::new(),
            response: &response,
        };

        append(&state, Role::Remote, &record).unwrap();
        append(&state, Role::Remote, &record).unwrap();

        let text = std::fs::read_to_string(log_path(&state, Role::Remote)).unwrap();
        assert_eq!(text.matches("[INPUT]").count(), 2);
        assert!(text.contains(r#"  ->{"site1":{"vote":true}}"#));
        assert!(text.contains(r#""success":false"#));
    }
}
