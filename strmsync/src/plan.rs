//! Per-entry decision making: where a remote entry lands locally and whether
//! to emit a locator file, download the asset, or leave it alone.

use std::collections::HashSet;

use camino::Utf8PathBuf;
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

use crate::alist::RemoteEntry;
use crate::config::SourceConfig;

pub const VIDEO_EXTS: &[&str] = &[
    ".mp4", ".mkv", ".m2ts", ".ts", ".avi", ".mov", ".wmv", ".flv", ".webm", ".iso", ".m3u8",
];
pub const SUBTITLE_EXTS: &[&str] = &[".srt", ".ass", ".ssa", ".sub", ".vtt"];
pub const IMAGE_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".bmp", ".webp"];
pub const NFO_EXTS: &[&str] = &[".nfo"];

pub const LOCATOR_EXT: &str = "strm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum LocatorMode {
    /// Locator content is the server-proxied download URL.
    #[strum(serialize = "LocatorPublicURL")]
    PublicUrl,
    /// Locator content is the origin URL behind the remote; requires
    /// detailed listings.
    #[strum(serialize = "LocatorOriginURL")]
    OriginUrl,
    /// Locator content is the remote path with a configured prefix.
    #[strum(serialize = "LocatorRemotePath")]
    RemotePath,
}

impl LocatorMode {
    /// An unknown mode falls back to the default with a warning rather than
    /// failing the run.
    pub fn from_config(mode: &str) -> LocatorMode {
        match mode.parse() {
            Ok(mode) => mode,
            Err(_) => {
                warn!("unknown locator mode {mode:?}, falling back to LocatorPublicURL");
                LocatorMode::PublicUrl
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    WriteLocator { content: String },
    Download { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlan {
    pub local_path: Utf8PathBuf,
    pub action: PlanAction,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Directory or unhandled extension; nothing to record.
    Ignore,
    /// Destination already exists and overwrite is off. The path is still
    /// recorded so reverse-sync keeps the file, but no work is scheduled.
    UpToDate(Utf8PathBuf),
    Execute(LocalPlan),
}

/// Derived once per mirror run from the owning [`SourceConfig`].
pub struct Planner {
    mode: LocatorMode,
    source_dir: String,
    target_dir: Utf8PathBuf,
    flatten_mode: bool,
    overwrite: bool,
    locator_content_prefix: String,
    download_exts: HashSet<String>,
}

impl Planner {
    pub fn new(source: &SourceConfig, mode: LocatorMode) -> Planner {
        let mut download_exts = HashSet::new();
        // In flatten mode everything lands in one directory, so auxiliary
        // assets are not emitted at all: only the locator files survive.
        if !source.flatten_mode {
            if source.subtitle {
                download_exts.extend(SUBTITLE_EXTS.iter().map(|e| e.to_string()));
            }
            if source.image {
                download_exts.extend(IMAGE_EXTS.iter().map(|e| e.to_string()));
            }
            if source.nfo {
                download_exts.extend(NFO_EXTS.iter().map(|e| e.to_string()));
            }
            for ext in source.other_exts.split(',') {
                let ext = ext.trim().to_ascii_lowercase();
                if ext.is_empty() {
                    continue;
                }
                if ext.starts_with('.') {
                    download_exts.insert(ext);
                } else {
                    download_exts.insert(format!(".{ext}"));
                }
            }
        }
        Planner {
            mode,
            source_dir: source.source_dir.clone(),
            target_dir: source.target_dir.clone(),
            flatten_mode: source.flatten_mode,
            overwrite: source.overwrite,
            locator_content_prefix: source.locator_content_prefix.clone(),
            download_exts,
        }
    }

    /// Resolves `entry` to its local destination and action without touching
    /// the filesystem. `None` means the entry is not processed at all.
    pub fn resolve(&self, entry: &RemoteEntry) -> Option<LocalPlan> {
        if entry.is_dir {
            return None;
        }
        let ext = entry.suffix();
        let is_video = VIDEO_EXTS.contains(&ext.as_str());
        if !is_video && !self.download_exts.contains(&ext) {
            return None;
        }

        let local_path = self.local_path(entry, is_video);
        let action = if is_video {
            let content = match self.mode {
                LocatorMode::PublicUrl => entry.download_url.clone(),
                LocatorMode::OriginUrl => match &entry.raw_url {
                    Some(raw_url) => raw_url.clone(),
                    None => {
                        warn!("{} has no origin url, skipping", entry.path);
                        return None;
                    }
                },
                LocatorMode::RemotePath => {
                    format!("{}{}", self.locator_content_prefix, entry.path)
                }
            };
            PlanAction::WriteLocator { content }
        } else {
            PlanAction::Download {
                url: entry.download_url.clone(),
            }
        };
        Some(LocalPlan { local_path, action })
    }

    /// Full decision for `entry`, including the overwrite rule.
    pub fn plan(&self, entry: &RemoteEntry) -> PlanOutcome {
        let Some(plan) = self.resolve(entry) else {
            if !entry.is_dir {
                debug!("{} is not in the processing list", entry.name);
            }
            return PlanOutcome::Ignore;
        };
        if !self.overwrite && plan.local_path.as_std_path().exists() {
            debug!("{} already exists, skipping {}", plan.local_path, entry.path);
            return PlanOutcome::UpToDate(plan.local_path);
        }
        PlanOutcome::Execute(plan)
    }

    fn local_path(&self, entry: &RemoteEntry, is_video: bool) -> Utf8PathBuf {
        let mut local = if self.flatten_mode {
            self.target_dir.join(&entry.name)
        } else {
            let relative = entry.path.replacen(&self.source_dir, "", 1);
            let relative = relative.strip_prefix('/').unwrap_or(&relative);
            self.target_dir.join(relative)
        };
        if is_video {
            local.set_extension(LOCATOR_EXT);
        }
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceConfig {
        serde_yaml::from_str(
            r#"
id: movies
source_dir: /media/movies
target_dir: /out
"#,
        )
        .unwrap()
    }

    fn entry(name: &str, path: &str) -> RemoteEntry {
        RemoteEntry {
            name: name.to_owned(),
            path: path.to_owned(),
            is_dir: false,
            size: 1024,
            modified_at: None,
            download_url: format!("https://alist.example.com/d{path}"),
            raw_url: None,
        }
    }

    #[test]
    fn unknown_mode_falls_back_to_public_url() {
        assert_eq!(LocatorMode::from_config("bogus"), LocatorMode::PublicUrl);
        assert_eq!(
            LocatorMode::from_config("LocatorRemotePath"),
            LocatorMode::RemotePath
        );
    }

    #[test]
    fn video_becomes_locator_under_mirrored_path() {
        let planner = Planner::new(&source(), LocatorMode::PublicUrl);
        let entry = entry("a.mkv", "/media/movies/sub/a.mkv");
        let plan = planner.resolve(&entry).unwrap();
        assert_eq!(plan.local_path, Utf8PathBuf::from("/out/sub/a.strm"));
        assert_eq!(
            plan.action,
            PlanAction::WriteLocator {
                content: "https://alist.example.com/d/media/movies/sub/a.mkv".to_owned()
            }
        );
    }

    #[test]
    fn flatten_mode_drops_directories_and_assets() {
        let mut config = source();
        config.flatten_mode = true;
        config.subtitle = true;
        let planner = Planner::new(&config, LocatorMode::PublicUrl);

        let video = entry("a.mkv", "/media/movies/sub/a.mkv");
        let plan = planner.resolve(&video).unwrap();
        assert_eq!(plan.local_path, Utf8PathBuf::from("/out/a.strm"));

        // subtitles are configured on, but flatten mode overrides that
        let subtitle = entry("a.srt", "/media/movies/sub/a.srt");
        assert!(planner.resolve(&subtitle).is_none());
    }

    #[test]
    fn download_extensions_follow_the_config() {
        let mut config = source();
        config.subtitle = true;
        config.other_exts = "TXT, .lrc".to_owned();
        let planner = Planner::new(&config, LocatorMode::PublicUrl);

        let srt = entry("a.srt", "/media/movies/a.srt");
        assert!(matches!(
            planner.resolve(&srt).unwrap().action,
            PlanAction::Download { .. }
        ));
        let txt = entry("notes.txt", "/media/movies/notes.txt");
        assert_eq!(
            planner.resolve(&txt).unwrap().local_path,
            Utf8PathBuf::from("/out/notes.txt")
        );
        let lrc = entry("a.lrc", "/media/movies/a.lrc");
        assert!(planner.resolve(&lrc).is_some());

        // images were not enabled
        let jpg = entry("poster.jpg", "/media/movies/poster.jpg");
        assert!(planner.resolve(&jpg).is_none());
    }

    #[test]
    fn remote_path_mode_prefixes_the_path() {
        let mut config = source();
        config.locator_content_prefix = "alist://".to_owned();
        let planner = Planner::new(&config, LocatorMode::RemotePath);
        let entry = entry("a.mkv", "/media/movies/a.mkv");
        let plan = planner.resolve(&entry).unwrap();
        assert_eq!(
            plan.action,
            PlanAction::WriteLocator {
                content: "alist:///media/movies/a.mkv".to_owned()
            }
        );
    }

    #[test]
    fn origin_mode_without_raw_url_is_skipped() {
        let planner = Planner::new(&source(), LocatorMode::OriginUrl);
        let plain = entry("a.mkv", "/media/movies/a.mkv");
        assert!(planner.resolve(&plain).is_none());

        let mut detailed = entry("a.mkv", "/media/movies/a.mkv");
        detailed.raw_url = Some("https://cdn.example.com/a.mkv".to_owned());
        let plan = planner.resolve(&detailed).unwrap();
        assert_eq!(
            plan.action,
            PlanAction::WriteLocator {
                content: "https://cdn.example.com/a.mkv".to_owned()
            }
        );
    }

    #[test]
    fn existing_destination_is_recorded_but_not_rewritten() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut config = source();
        config.target_dir = dir.path().to_owned();
        let planner = Planner::new(&config, LocatorMode::PublicUrl);

        let remote = entry("a.mkv", "/media/movies/a.mkv");
        let destination = dir.path().join("a.strm");

        assert!(matches!(planner.plan(&remote), PlanOutcome::Execute(_)));

        std::fs::write(&destination, "old content").unwrap();
        assert_eq!(planner.plan(&remote), PlanOutcome::UpToDate(destination));

        config.overwrite = true;
        let planner = Planner::new(&config, LocatorMode::PublicUrl);
        assert!(matches!(planner.plan(&remote), PlanOutcome::Execute(_)));
    }

    #[test]
    fn directories_are_ignored() {
        let planner = Planner::new(&source(), LocatorMode::PublicUrl);
        let mut dir_entry = entry("season 1", "/media/movies/season 1");
        dir_entry.is_dir = true;
        assert_eq!(planner.plan(&dir_entry), PlanOutcome::Ignore);
    }
}
