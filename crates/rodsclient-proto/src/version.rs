use serde::Serialize;

/// Server release information from the `RODS_VERSION` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerVersion {
    /// Release string as sent by the server, e.g. `rods4.3.0`.
    pub release: String,
    pub api: String,
    pub reconn_port: i32,
    pub reconn_addr: String,
    pub cookie: i32,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub fn new(release: impl Into<String>, api: impl Into<String>) -> Self {
        let release = release.into();
        let (major, minor, patch) = parse_release(&release).unwrap_or((0, 0, 0));
        Self {
            release,
            api: api.into(),
            major,
            minor,
            patch,
            ..Default::default()
        }
    }

    /// True when this release is at least `major.minor.patch`.
    pub fn has_higher_version_than(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// Releases after 4.2.8 escape XML the standard way. Release strings
    /// that do not look like `rodsX.Y.Z` are assumed to be modern.
    pub fn talks_correct_xml(&self) -> bool {
        match parse_release(&self.release) {
            Some(v) => v > (4, 2, 8),
            None => true,
        }
    }
}

fn parse_release(release: &str) -> Option<(u32, u32, u32)> {
    let numbers = release.trim().strip_prefix("rods")?;
    let parts: Vec<&str> = numbers.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let major = parts[0].parse().ok()?;
    let minor = parts[1].parse().ok()?;
    let patch = parts[2].parse().ok()?;
    Some((major, minor, patch))
}
