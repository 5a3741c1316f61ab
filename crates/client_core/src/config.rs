use std::{collections::HashMap, fs, path::Path, str::FromStr};

use shared::{
    domain::{PROTOCOL_SAMPLE_RATE, SAMPLES_PER_FRAME},
    transport::DEFAULT_LINK_CAPACITY,
};
use tracing::warn;

pub const SETTINGS_FILE: &str = "bridge.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Rate of the audio the foreground captures and plays back.
    pub sample_rate: u32,
    /// Outbound packet size at the protocol rate.
    pub samples_per_packet: u32,
    pub link_capacity: usize,
    /// Frames an inbound playback stream may queue before new ones are dropped.
    pub playback_queue_frames: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_rate: PROTOCOL_SAMPLE_RATE,
            samples_per_packet: SAMPLES_PER_FRAME,
            link_capacity: DEFAULT_LINK_CAPACITY,
            playback_queue_frames: 64,
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, &file_cfg),
            Err(err) => warn!(path = %path.display(), %err, "ignoring unreadable settings file"),
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("sample_rate") {
        set_positive(&mut settings.sample_rate, "sample_rate", v);
    }
    if let Some(v) = file_cfg.get("samples_per_packet") {
        set_positive(&mut settings.samples_per_packet, "samples_per_packet", v);
    }
    if let Some(v) = file_cfg.get("link_capacity") {
        set_positive(&mut settings.link_capacity, "link_capacity", v);
    }
    if let Some(v) = file_cfg.get("playback_queue_frames") {
        set_positive(&mut settings.playback_queue_frames, "playback_queue_frames", v);
    }
}

/// `BRIDGE_*` variables apply first so the `APP__*` spelling wins when both are set.
fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    for key in ["BRIDGE_SAMPLE_RATE", "APP__SAMPLE_RATE"] {
        if let Some(v) = var(key) {
            set_positive(&mut settings.sample_rate, key, &v);
        }
    }
    for key in ["BRIDGE_SAMPLES_PER_PACKET", "APP__SAMPLES_PER_PACKET"] {
        if let Some(v) = var(key) {
            set_positive(&mut settings.samples_per_packet, key, &v);
        }
    }
    for key in ["BRIDGE_LINK_CAPACITY", "APP__LINK_CAPACITY"] {
        if let Some(v) = var(key) {
            set_positive(&mut settings.link_capacity, key, &v);
        }
    }
    for key in ["BRIDGE_PLAYBACK_QUEUE_FRAMES", "APP__PLAYBACK_QUEUE_FRAMES"] {
        if let Some(v) = var(key) {
            set_positive(&mut settings.playback_queue_frames, key, &v);
        }
    }
}

fn set_positive<T>(slot: &mut T, key: &str, raw: &str)
where
    T: FromStr + PartialOrd + Default,
{
    match raw.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => *slot = parsed,
        _ => warn!(key, value = raw, "ignoring setting; expected a positive integer"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn defaults_match_protocol_frame() {
        let settings = Settings::default();
        assert_eq!(settings.sample_rate, 48_000);
        assert_eq!(settings.samples_per_packet, 480);
        assert_eq!(settings.link_capacity, 1024);
        assert_eq!(settings.playback_queue_frames, 64);
    }

    #[test]
    fn reads_flat_string_table_from_file() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("voice_bridge_settings_{suffix}.toml"));
        fs::write(
            &path,
            "sample_rate = \"44100\"\nlink_capacity = \"16\"\nplayback_queue_frames = \"zero\"\n",
        )
        .expect("write settings");

        let settings = load_settings_from(&path);
        fs::remove_file(&path).expect("cleanup");

        assert_eq!(settings.sample_rate, 44_100);
        assert_eq!(settings.link_capacity, 16);
        assert_eq!(settings.playback_queue_frames, 64);
    }

    #[test]
    fn app_prefixed_variables_win_over_bridge_ones() {
        let vars: HashMap<&str, &str> = [
            ("BRIDGE_SAMPLE_RATE", "22050"),
            ("APP__SAMPLE_RATE", "16000"),
            ("BRIDGE_SAMPLES_PER_PACKET", "960"),
            ("APP__LINK_CAPACITY", "0"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        apply_env(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.sample_rate, 16_000);
        assert_eq!(settings.samples_per_packet, 960);
        assert_eq!(settings.link_capacity, 1024);
    }
}
