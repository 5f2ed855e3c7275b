//! TeamTalk 5 user-right bits and name mapping.
//!
//! Right names accepted in `TEAMTALK_DEFAULT_USER_RIGHTS` are the SDK
//! constant names without the `USERRIGHT_` prefix.

pub const MULTI_LOGIN: u32 = 0x0000_0001;
pub const VIEW_ALL_USERS: u32 = 0x0000_0002;
pub const CREATE_TEMPORARY_CHANNEL: u32 = 0x0000_0004;
pub const MODIFY_CHANNELS: u32 = 0x0000_0008;
pub const TEXTMESSAGE_BROADCAST: u32 = 0x0000_0010;
pub const KICK_USERS: u32 = 0x0000_0020;
pub const BAN_USERS: u32 = 0x0000_0040;
pub const MOVE_USERS: u32 = 0x0000_0080;
pub const OPERATOR_ENABLE: u32 = 0x0000_0100;
pub const UPLOAD_FILES: u32 = 0x0000_0200;
pub const DOWNLOAD_FILES: u32 = 0x0000_0400;
pub const UPDATE_SERVERPROPERTIES: u32 = 0x0000_0800;
pub const TRANSMIT_VOICE: u32 = 0x0000_1000;
pub const TRANSMIT_VIDEOCAPTURE: u32 = 0x0000_2000;
pub const TRANSMIT_DESKTOP: u32 = 0x0000_4000;
pub const TRANSMIT_DESKTOPINPUT: u32 = 0x0000_8000;
pub const TRANSMIT_MEDIAFILE_AUDIO: u32 = 0x0001_0000;
pub const TRANSMIT_MEDIAFILE_VIDEO: u32 = 0x0002_0000;
pub const LOCKED_NICKNAME: u32 = 0x0004_0000;
pub const LOCKED_STATUS: u32 = 0x0008_0000;
pub const RECORD_VOICE: u32 = 0x0010_0000;
pub const VIEW_HIDDEN_CHANNELS: u32 = 0x0020_0000;
pub const TEXTMESSAGE_USER: u32 = 0x0040_0000;
pub const TEXTMESSAGE_CHANNEL: u32 = 0x0080_0000;

/// Combined audio+video media-file right, kept for config compatibility.
pub const TRANSMIT_MEDIAFILE: u32 = TRANSMIT_MEDIAFILE_AUDIO | TRANSMIT_MEDIAFILE_VIDEO;

fn right_from_name(name: &str) -> Option<u32> {
    let bit = match name {
        "MULTI_LOGIN" => MULTI_LOGIN,
        "VIEW_ALL_USERS" => VIEW_ALL_USERS,
        "CREATE_TEMPORARY_CHANNEL" => CREATE_TEMPORARY_CHANNEL,
        "MODIFY_CHANNELS" => MODIFY_CHANNELS,
        "TEXTMESSAGE_BROADCAST" => TEXTMESSAGE_BROADCAST,
        "KICK_USERS" => KICK_USERS,
        "BAN_USERS" => BAN_USERS,
        "MOVE_USERS" => MOVE_USERS,
        "OPERATOR_ENABLE" => OPERATOR_ENABLE,
        "UPLOAD_FILES" => UPLOAD_FILES,
        "DOWNLOAD_FILES" => DOWNLOAD_FILES,
        "UPDATE_SERVERPROPERTIES" => UPDATE_SERVERPROPERTIES,
        "TRANSMIT_VOICE" => TRANSMIT_VOICE,
        "TRANSMIT_VIDEOCAPTURE" => TRANSMIT_VIDEOCAPTURE,
        "TRANSMIT_DESKTOP" => TRANSMIT_DESKTOP,
        "TRANSMIT_DESKTOPINPUT" => TRANSMIT_DESKTOPINPUT,
        "TRANSMIT_MEDIAFILE" => TRANSMIT_MEDIAFILE,
        "TRANSMIT_MEDIAFILE_AUDIO" => TRANSMIT_MEDIAFILE_AUDIO,
        "TRANSMIT_MEDIAFILE_VIDEO" => TRANSMIT_MEDIAFILE_VIDEO,
        "LOCKED_NICKNAME" => LOCKED_NICKNAME,
        "LOCKED_STATUS" => LOCKED_STATUS,
        "RECORD_VOICE" => RECORD_VOICE,
        "VIEW_HIDDEN_CHANNELS" => VIEW_HIDDEN_CHANNELS,
        "TEXTMESSAGE_USER" => TEXTMESSAGE_USER,
        "TEXTMESSAGE_CHANNEL" => TEXTMESSAGE_CHANNEL,
        _ => return None,
    };
    Some(bit)
}

/// Fold a list of right names into the combined bit mask.
/// Unknown names are logged and skipped rather than failing startup.
pub fn rights_from_names<S: AsRef<str>>(names: &[S]) -> u32 {
    let mut mask = 0;
    for name in names {
        let name = name.as_ref().trim();
        match right_from_name(name) {
            Some(bit) => mask |= bit,
            None => log::warn!("Unknown user right '{name}' in configuration, skipping"),
        }
    }
    mask
}
