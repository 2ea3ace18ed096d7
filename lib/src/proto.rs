//! Wire protocol between clients, the coordinator and executors.
//!
//! Requests are form-encoded key/value pairs gated by the `HEADER` field;
//! responses are a fixed prefix followed by `"<code> <msg>"`.

use crate::error::{ErrorKind, FkResult};

/// Prefix of every response body produced by coordinator and executors.
pub const RET_MSG_HEADER: &str = "FKRET:";

/// `HEADER` value on worker registration and heartbeat requests.
pub const WORKER_HEADER: &str = "FK-WORKER";
/// `HEADER` value on coordinator-to-executor commands.
pub const COMMAND_HEADER: &str = "FK-COMMAND";
/// `HEADER` value on executor-to-coordinator callbacks.
pub const CALLBACK_HEADER: &str = "FK-CALLBACK";

/// Separator of task ids inside a heartbeat's `tasks` field.
pub const TASK_SPLITTER: char = '|';

/// Timestamp format of heartbeats and task ids.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
/// Day format used in URLs and callback forms.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Render the response envelope with an explicit message.
pub fn make_response(code: ErrorKind, msg: &str) -> String {
    format!("{}{} {}", RET_MSG_HEADER, code.code(), msg)
}

/// Render the response envelope with the kind's own description.
pub fn make_response_default(code: ErrorKind) -> String {
    make_response(code, &code.to_string())
}

/// Parse a response body back into `(code, message)`. A body that does not
/// carry the envelope prefix is someone else's error page, not ours.
pub fn parse_response(body: &str) -> FkResult<(ErrorKind, String)> {
    let rest = body
        .strip_prefix(RET_MSG_HEADER)
        .ok_or(ErrorKind::ServerInternalError)?;

    let (code, msg) = match rest.find(' ') {
        Some(pos) => (&rest[..pos], rest[pos + 1..].to_string()),
        None => (rest, String::new()),
    };

    let code: i32 = code
        .trim()
        .parse()
        .map_err(|_| ErrorKind::ServerInternalError)?;

    Ok((ErrorKind::from(code), msg))
}

/// Join live task ids into the heartbeat `tasks` field.
pub fn join_task_ids<S: AsRef<str>>(ids: &[S]) -> String {
    ids.iter()
        .map(|id| id.as_ref())
        .collect::<Vec<_>>()
        .join(&TASK_SPLITTER.to_string())
}

/// Split the heartbeat `tasks` field, dropping empty entries.
pub fn split_task_ids(raw: &str) -> Vec<String> {
    raw.split(TASK_SPLITTER)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let body = make_response(ErrorKind::LinkageNotExists, "no such linkage");
        let (code, msg) = parse_response(&body).unwrap();
        assert_eq!(code, ErrorKind::LinkageNotExists);
        assert_eq!(msg, "no such linkage");
    }

    #[test]
    fn test_success_envelope() {
        let body = make_response_default(ErrorKind::Success);
        assert_eq!(body, "FKRET:0 SUCCESS");
        let (code, msg) = parse_response(&body).unwrap();
        assert_eq!(code, ErrorKind::Success);
        assert_eq!(msg, "SUCCESS");
    }

    #[test]
    fn test_parse_rejects_foreign_body() {
        assert_eq!(
            parse_response("<html>502 Bad Gateway</html>"),
            Err(ErrorKind::ServerInternalError)
        );
    }

    #[test]
    fn test_parse_code_without_message() {
        let (code, msg) = parse_response("FKRET:0").unwrap();
        assert_eq!(code, ErrorKind::Success);
        assert!(msg.is_empty());
    }

    #[test]
    fn test_task_id_list_round_trip() {
        let ids = ["a#1", "b#2", "c#3"];
        let joined = join_task_ids(&ids);
        assert_eq!(joined, "a#1|b#2|c#3");
        assert_eq!(split_task_ids(&joined), vec!["a#1", "b#2", "c#3"]);
        assert!(split_task_ids("").is_empty());
        assert_eq!(split_task_ids(" a#1 | "), vec!["a#1"]);
    }
}
