//! Environment handed to a launched process.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;

use socket_activation::{LISTEN_FDS_START, NOTIFY_SOCKET};

/// Variables describing descriptors or sockets that belong to the supervisor.
/// They are dropped from the inherited environment and set again only when
/// they apply to the new process.
const OWNED_VARIABLES: [&str; 5] = [
    "LISTEN_PID",
    "LISTEN_FDS",
    "LISTEN_FDNAMES",
    "EINHORN_FDS",
    NOTIFY_SOCKET,
];

/// Name published in `LISTEN_FDNAMES` for every passed descriptor.
const FD_NAME: &str = "socket";

/// Build the environment of a new process.
///
/// Starts from `inherited`, strips supervisor-owned variables, describes
/// `listen_count` passed descriptors, publishes the readiness socket and
/// finally applies `overlay`, which wins on conflicts.
pub fn build<I>(
    inherited: I,
    listen_count: usize,
    notify_socket: Option<&Path>,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: BTreeMap<OsString, OsString> = inherited
        .into_iter()
        .filter(|(key, _)| !OWNED_VARIABLES.iter().any(|owned| key == OsStr::new(owned)))
        .collect();

    if listen_count > 0 {
        env.insert("LISTEN_FDS".into(), listen_count.to_string().into());
        env.insert(
            "LISTEN_FDNAMES".into(),
            vec![FD_NAME; listen_count].join(":").into(),
        );
        let einhorn = (LISTEN_FDS_START..)
            .take(listen_count)
            .map(|fd| fd.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        env.insert("EINHORN_FDS".into(), einhorn.into());
    }

    if let Some(path) = notify_socket {
        env.insert(NOTIFY_SOCKET.into(), path.as_os_str().to_owned());
    }

    for (key, value) in overlay {
        env.insert(key.into(), value.into());
    }

    env
}
