//! Charsets found in `.vmx` files.
//!
//! VMware writes an `.encoding` key naming the charset of the file. Files
//! without one (or naming something unknown) are legacy Windows-1252.

/// Characters for bytes 0x80..=0x9F in Windows-1252. Undefined slots decode
/// to the C1 control with the same value, like ISO-8859-1.
const WINDOWS_1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Windows1252,
    Latin1,
}

impl Charset {
    /// Charset assumed when a file does not declare one.
    pub const LEGACY: Charset = Charset::Windows1252;

    /// Resolve a charset label as written in `.encoding`.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "utf8" => Some(Charset::Utf8),
            "windows1252" | "cp1252" => Some(Charset::Windows1252),
            "iso88591" | "latin1" | "usascii" | "ascii" => Some(Charset::Latin1),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Windows1252 => "windows-1252",
            Charset::Latin1 => "ISO-8859-1",
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Charset::Windows1252 => bytes
                .iter()
                .map(|&b| match b {
                    0x80..=0x9F => WINDOWS_1252_HIGH[(b - 0x80) as usize],
                    _ => b as char,
                })
                .collect(),
        }
    }

    /// Encode text; characters the charset cannot represent become `?`.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            Charset::Windows1252 => text.chars().map(encode_windows_1252).collect(),
        }
    }
}

fn encode_windows_1252(c: char) -> u8 {
    if let Some(pos) = WINDOWS_1252_HIGH.iter().position(|&h| h == c) {
        return 0x80 + pos as u8;
    }
    match u32::from(c) {
        v @ 0x00..=0x7F | v @ 0xA0..=0xFF => v as u8,
        _ => b'?',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_label() {
        assert_eq!(Charset::from_label("UTF-8"), Some(Charset::Utf8));
        assert_eq!(Charset::from_label("windows-1252"), Some(Charset::Windows1252));
        assert_eq!(Charset::from_label("ISO-8859-1"), Some(Charset::Latin1));
        assert_eq!(Charset::from_label("klingon"), None);
    }

    #[test]
    fn test_windows_1252_euro_sign() {
        assert_eq!(Charset::Windows1252.decode(&[0x80]), "\u{20AC}");
        assert_eq!(Charset::Windows1252.encode("\u{20AC}"), vec![0x80]);
        assert_eq!(Charset::Latin1.decode(&[0x80]), "\u{0080}");
    }

    #[test]
    fn test_umlaut_round_trip() {
        let text = "Prüfung";
        for charset in [Charset::Utf8, Charset::Windows1252, Charset::Latin1] {
            assert_eq!(charset.decode(&charset.encode(text)), text);
        }
    }

    #[test]
    fn test_unencodable_becomes_question_mark() {
        assert_eq!(Charset::Latin1.encode("a\u{4E2D}"), b"a?".to_vec());
    }
}
