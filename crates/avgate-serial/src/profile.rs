#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub name: &'static str,
    pub baud: u32,
    /// Canned commands with literal `\r` / `\n` escapes, as the UI edits them.
    pub presets: [&'static str; 3],
}

pub const PROFILES: [Profile; 4] = [
    Profile { name: "Generic", baud: 9600, presets: ["PWR ON\\r", "PWR OFF\\r", "STATUS?\\r"] },
    Profile { name: "Extron", baud: 9600, presets: ["1*\\r", "1%\\r", "Q\\r"] },
    Profile { name: "Blustream", baud: 9600, presets: ["PWR ON\\r", "PWR OFF\\r", "VOL 50\\r"] },
    Profile { name: "Kramer", baud: 115_200, presets: ["#POWER-MODE 1\\r", "#POWER-MODE 0\\r", "#POWER-MODE?\\r"] },
];

pub fn profile(index: usize) -> Option<&'static Profile> {
    PROFILES.get(index)
}

impl Profile {
    /// Preset `n` (1-based) with escapes turned into control characters.
    pub fn preset(&self, n: u8) -> Option<String> {
        let raw = self.presets.get(usize::from(n).checked_sub(1)?)?;
        Some(unescape_controls(raw))
    }
}

pub fn unescape_controls(s: &str) -> String {
    s.replace("\\r", "\r").replace("\\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_one_based() {
        let p = profile(1).unwrap();
        assert_eq!(p.preset(1).as_deref(), Some("1*\r"));
        assert_eq!(p.preset(3).as_deref(), Some("Q\r"));
        assert_eq!(p.preset(0), None);
        assert_eq!(p.preset(4), None);
    }

    #[test]
    fn every_profile_is_reachable() {
        assert_eq!(profile(3).map(|p| p.baud), Some(115_200));
        assert!(profile(4).is_none());
    }

    #[test]
    fn unescape_handles_both_terminators() {
        assert_eq!(unescape_controls("A\\r\\nB"), "A\r\nB");
        assert_eq!(unescape_controls("plain"), "plain");
    }
}
