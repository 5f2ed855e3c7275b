//! Connection artifact generation.
//!
//! Builds the `.tt` connection descriptor, the `tt://` quick-connect link,
//! and (optionally) a pre-configured portable client archive. Output is
//! deterministic and byte-pinned by tests: TeamTalk clients are picky about
//! quoting, and escaping regressions historically broke imports across
//! client versions.

pub mod archive;

use url::form_urlencoded::byte_serialize;

use crate::core::config::ServerProfile;

pub use archive::build_client_archive;

/// XML-escape a value for embedding into a `.tt` descriptor.
fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Percent-encode a query value, form style (space becomes `+`).
fn form_encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// Like [`form_encode`], but keeps `/` literal. Channel paths are written
/// as `channel=/` in `tt://` links and clients reject the escaped form.
fn form_encode_path(value: &str) -> String {
    value.split('/').map(|seg| form_encode(seg)).collect::<Vec<_>>().join("/")
}

/// Build the `.tt` connection descriptor understood by TeamTalk 5 clients.
///
/// The nickname defaults to the username when empty.
pub fn build_descriptor(
    profile: &ServerProfile,
    username: &str,
    password: &str,
    nickname: Option<&str>,
) -> String {
    let encrypted = if profile.encrypted { "true" } else { "false" };
    let nickname = match nickname {
        Some(n) if !n.trim().is_empty() => n,
        _ => username,
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8" ?>
<!DOCTYPE teamtalk>
<teamtalk version="5.0">
 <host>
  <name>{name}</name>
  <address>{address}</address>
  <tcpport>{tcpport}</tcpport>
  <udpport>{udpport}</udpport>
  <encrypted>{encrypted}</encrypted>
  <trusted-certificate>
   <certificate-authority-pem></certificate-authority-pem>
   <client-certificate-pem></client-certificate-pem>
   <client-private-key-pem></client-private-key-pem>
   <verify-peer>false</verify-peer>
  </trusted-certificate>
  <auth>
   <username>{username}</username>
   <password>{password}</password>
   <nickname>{nickname}</nickname>
  </auth>
 </host>
</teamtalk>"#,
        name = profile.name,
        address = profile.host,
        tcpport = profile.tcp_port,
        udpport = profile.udp_port,
        encrypted = encrypted,
        username = xml_escape(username),
        password = xml_escape(password),
        nickname = xml_escape(nickname),
    )
}

/// Build the `tt://` quick-connect link encoding the same fields as the
/// descriptor.
pub fn build_quick_connect_link(
    profile: &ServerProfile,
    username: &str,
    password: &str,
    nickname: Option<&str>,
    channel: Option<&str>,
    channel_password: &str,
) -> String {
    let encrypted = if profile.encrypted { "1" } else { "0" };
    let nickname = match nickname {
        Some(n) if !n.trim().is_empty() => n,
        _ => username,
    };
    format!(
        "tt://{host}?tcpport={tcpport}&udpport={udpport}&encrypted={encrypted}\
&username={username}&password={password}&nickname={nickname}&channel={channel}&chanpasswd={chanpasswd}",
        host = profile.host,
        tcpport = profile.tcp_port,
        udpport = profile.udp_port,
        encrypted = encrypted,
        username = form_encode(username),
        password = form_encode(password),
        nickname = form_encode(nickname),
        channel = form_encode_path(channel.unwrap_or("/")),
        chanpasswd = form_encode(channel_password),
    )
}

/// Filename under which the descriptor is offered for download.
pub fn descriptor_filename(username: &str) -> String {
    let safe: String = username
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}.tt")
}

/// Filename for the pre-configured client archive.
pub fn archive_filename(username: &str, server_name: &str) -> String {
    let safe: String = username
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let safe_server: String = server_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}_{safe_server}_config.zip")
}
