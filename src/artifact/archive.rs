//! Pre-configured portable client archive.
//!
//! Takes a template directory holding an unpacked TeamTalk client with
//! `Client/TeamTalk5.ini` inside, rewrites the ini with the server entry
//! and user credentials, adds the user's `.tt` descriptor next to it and
//! zips the whole tree. A template without the ini yields
//! [`AppError::TemplateMissing`] — registration itself is unaffected, only
//! the archive download is disabled.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::core::config::ServerProfile;
use crate::core::error::{AppError, AppResult};

/// Candidate ini locations inside the template, checked in order.
const INI_CANDIDATES: [&str; 2] = ["Client/TeamTalk5.ini", "Client/teamtalk5.ini"];

/// Minimal INI editor that preserves unknown lines, ordering and comments.
/// Values are written `key=value` with no delimiter padding, which is what
/// the TeamTalk client writes itself.
struct IniDocument {
    lines: Vec<String>,
}

impl IniDocument {
    fn parse(content: &str) -> Self {
        IniDocument { lines: content.lines().map(str::to_string).collect() }
    }

    /// Index range [start, end) of a section's body, if present.
    fn section_bounds(&self, section: &str) -> Option<(usize, usize)> {
        let header = format!("[{section}]");
        let start = self.lines.iter().position(|l| l.trim() == header)? + 1;
        let end = self.lines[start..]
            .iter()
            .position(|l| l.trim_start().starts_with('['))
            .map_or(self.lines.len(), |i| start + i);
        Some((start, end))
    }

    fn set(&mut self, section: &str, key: &str, value: &str) {
        let entry = format!("{key}={value}");
        match self.section_bounds(section) {
            Some((start, end)) => {
                let prefix = format!("{key}=");
                for line in &mut self.lines[start..end] {
                    if line.trim_start().starts_with(&prefix) {
                        *line = entry;
                        return;
                    }
                }
                self.lines.insert(end, entry);
            }
            None => {
                self.lines.push(format!("[{section}]"));
                self.lines.push(entry);
            }
        }
    }

    fn set_if_absent(&mut self, section: &str, key: &str, value: &str) {
        let prefix = format!("{key}=");
        if let Some((start, end)) = self.section_bounds(section) {
            if self.lines[start..end].iter().any(|l| l.trim_start().starts_with(&prefix)) {
                return;
            }
        }
        self.set(section, key, value);
    }

    fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Locate the client ini inside the template directory.
fn find_template_ini(template_dir: &Path) -> AppResult<PathBuf> {
    if !template_dir.is_dir() {
        return Err(AppError::TemplateMissing(template_dir.display().to_string()));
    }
    for candidate in INI_CANDIDATES {
        let path = template_dir.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(AppError::TemplateMissing(format!(
        "{} (expected {})",
        template_dir.display(),
        INI_CANDIDATES[0]
    )))
}

/// Rewrite the template ini with server entry 0 pointing at our server and
/// logging in as the freshly created account.
fn rewrite_ini(
    content: &str,
    profile: &ServerProfile,
    username: &str,
    password: &str,
    nickname: &str,
    lang: &str,
) -> String {
    let mut ini = IniDocument::parse(content);

    ini.set("general_", "first-start", "false");
    ini.set("general_", "nickname", nickname);
    ini.set("display", "language", if lang == "ru" { "ru" } else { "en" });
    ini.set("connection", "autoconnect", "true");

    ini.set("serverentries", "0_name", &profile.name);
    ini.set("serverentries", "0_hostaddr", &profile.host);
    ini.set("serverentries", "0_tcpport", &profile.tcp_port.to_string());
    ini.set("serverentries", "0_udpport", &profile.udp_port.to_string());
    ini.set("serverentries", "0_encrypted", if profile.encrypted { "true" } else { "false" });
    ini.set("serverentries", "0_username", username);
    ini.set("serverentries", "0_password", password);
    ini.set("serverentries", "0_nickname", nickname);
    ini.set("serverentries", "0_channel", "/");
    ini.set_if_absent("serverentries", "0_join-last-channel", "false");
    ini.set_if_absent("serverentries", "0_chanpassword", "");
    ini.set("serverentries", "0_cadata", "");
    ini.set("serverentries", "0_certdata", "");
    ini.set("serverentries", "0_keydata", "");
    ini.set("serverentries", "0_verifypeer", "false");

    ini.render()
}

fn collect_files(dir: &Path, base: &Path, out: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, base, out)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push((rel, path));
        }
    }
    Ok(())
}

fn zip_failed(e: zip::result::ZipError) -> AppError {
    AppError::Other(anyhow::anyhow!("zip write failed: {e}"))
}

/// Build the archive bytes.
///
/// `descriptor` is the already generated `.tt` file content; it lands in
/// the archive as `Client/<username>.tt`.
pub fn build_client_archive(
    template_dir: &Path,
    profile: &ServerProfile,
    username: &str,
    password: &str,
    nickname: &str,
    lang: &str,
    descriptor: &str,
) -> AppResult<Vec<u8>> {
    let ini_path = find_template_ini(template_dir)?;
    let ini_raw = std::fs::read(&ini_path)?;
    let ini_text = String::from_utf8_lossy(&ini_raw);
    let ini_text = ini_text.as_ref();
    let ini_text = ini_text.strip_prefix('\u{feff}').unwrap_or(ini_text);
    let rewritten = rewrite_ini(ini_text, profile, username, password, nickname, lang);

    let ini_rel = ini_path
        .strip_prefix(template_dir)
        .unwrap_or(&ini_path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");

    let mut files = Vec::new();
    collect_files(template_dir, template_dir, &mut files)?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (rel, path) in files {
        writer.start_file(rel.as_str(), options).map_err(zip_failed)?;
        if rel == ini_rel {
            // The client expects a BOM, as written by its own settings code.
            writer.write_all("\u{feff}".as_bytes())?;
            writer.write_all(rewritten.as_bytes())?;
        } else {
            writer.write_all(&std::fs::read(&path)?)?;
        }
    }

    let descriptor_entry = format!("Client/{}", super::descriptor_filename(username));
    writer.start_file(descriptor_entry.as_str(), options).map_err(zip_failed)?;
    writer.write_all(descriptor.as_bytes())?;

    let cursor = writer.finish().map_err(zip_failed)?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile() -> ServerProfile {
        ServerProfile {
            name: "Voice HQ".to_string(),
            host: "voice.example.org".to_string(),
            tcp_port: 10333,
            udp_port: 10444,
            encrypted: false,
        }
    }

    #[test]
    fn ini_rewrite_replaces_and_appends() {
        let template = "[general_]\nfirst-start=true\nbandwidth=2\n\n[serverentries]\n0_name=Old\n";
        let out = rewrite_ini(template, &profile(), "alice", "pw", "alice", "en");

        assert!(out.contains("first-start=false"));
        // Untouched keys survive.
        assert!(out.contains("bandwidth=2"));
        assert!(out.contains("0_name=Voice HQ"));
        assert!(out.contains("0_hostaddr=voice.example.org"));
        assert!(out.contains("0_tcpport=10333"));
        assert!(out.contains("0_udpport=10444"));
        assert!(out.contains("0_username=alice"));
        // Sections absent from the template get created.
        assert!(out.contains("[connection]\nautoconnect=true"));
        assert!(out.contains("language=en"));
    }

    #[test]
    fn ini_set_if_absent_keeps_existing_value() {
        let template = "[serverentries]\n0_join-last-channel=true\n";
        let out = rewrite_ini(template, &profile(), "alice", "pw", "alice", "en");
        assert!(out.contains("0_join-last-channel=true"));
    }

    #[test]
    fn missing_ini_is_template_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Client")).unwrap();
        let err =
            build_client_archive(dir.path(), &profile(), "a", "b", "a", "en", "x").unwrap_err();
        assert!(matches!(err, AppError::TemplateMissing(_)));
    }

    #[test]
    fn archive_contains_rewritten_ini_and_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let client = dir.path().join("Client");
        std::fs::create_dir_all(&client).unwrap();
        std::fs::write(client.join("TeamTalk5.ini"), "[general_]\nfirst-start=true\n").unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hello").unwrap();

        let bytes = build_client_archive(
            dir.path(),
            &profile(),
            "alice",
            "pw",
            "alice",
            "en",
            "<teamtalk/>",
        )
        .unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"Client/TeamTalk5.ini".to_string()));
        assert!(names.contains(&"Client/alice.tt".to_string()));
        assert!(names.contains(&"readme.txt".to_string()));

        let mut ini = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("Client/TeamTalk5.ini").unwrap(), &mut ini)
            .unwrap();
        assert!(ini.starts_with('\u{feff}'));
        assert!(ini.contains("0_username=alice"));
        assert_eq!(ini.matches("first-start=").count(), 1);
    }
}
