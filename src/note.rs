use std::fmt;
use std::str::FromStr;

/// A lane index with piano-keyboard semantics: 12 notes per octave,
/// `c0` = 0. Used by the keyboard track; drums and layers use raw indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Note(pub i32);

impl Note {
    /// Whether this lane falls on a white key. Purely cosmetic: drives the
    /// background grid shading and the header key colors.
    pub fn is_white(&self) -> bool {
        matches!(self.0.rem_euclid(12), 0 | 2 | 4 | 5 | 7 | 9 | 11)
    }

    pub fn pos(&self) -> i32 {
        self.0
    }
}

impl FromStr for Note {
    type Err = String;

    /// Parses names like `c4`, `cs4`, `c#4`, `df3`, `db3`: a degree letter,
    /// an optional sharp/flat, and an octave number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.chars().collect();
        if chars.len() < 2 {
            return Err(format!("note {:?} too short", s));
        }

        let degree = chars[0].to_ascii_lowercase();
        let mut note = match degree {
            'c' => 0,
            'd' => 2,
            'e' => 4,
            'f' => 5,
            'g' => 7,
            'a' => 9,
            'b' => 11,
            _ => return Err(format!("invalid degree {:?} in note {:?}", chars[0], s)),
        };

        let mut i = 1;
        if !chars[i].is_ascii_digit() {
            match chars[i].to_ascii_lowercase() {
                's' | '#' => note += 1,
                'f' | 'b' => note -= 1,
                other => return Err(format!("invalid sharp/flat {:?} in note {:?}", other, s)),
            }
            i += 1;
        }

        let octave: i32 = s[i..]
            .parse()
            .map_err(|e| format!("invalid octave in note {:?}: {}", s, e))?;
        Ok(Note(note + 12 * octave))
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 12] = [
            "c", "cs", "d", "ds", "e", "f", "fs", "g", "gs", "a", "as", "b",
        ];
        let degree = self.0.rem_euclid(12) as usize;
        let octave = self.0.div_euclid(12);
        write!(f, "{}{}", NAMES[degree], octave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_notes() {
        assert_eq!("c4".parse::<Note>().unwrap(), Note(48));
        assert_eq!("C4".parse::<Note>().unwrap(), Note(48));
        assert_eq!("a3".parse::<Note>().unwrap(), Note(45));
        assert_eq!("b0".parse::<Note>().unwrap(), Note(11));
        assert_eq!("g10".parse::<Note>().unwrap(), Note(127));
    }

    #[test]
    fn test_parse_sharps_and_flats() {
        assert_eq!("cs4".parse::<Note>().unwrap(), Note(49));
        assert_eq!("c#4".parse::<Note>().unwrap(), Note(49));
        assert_eq!("df4".parse::<Note>().unwrap(), Note(49));
        assert_eq!("db4".parse::<Note>().unwrap(), Note(49));
        assert_eq!("bf2".parse::<Note>().unwrap(), Note(34));
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<Note>().is_err());
        assert!("c".parse::<Note>().is_err());
        assert!("h4".parse::<Note>().is_err());
        assert!("cx4".parse::<Note>().is_err());
        assert!("c#".parse::<Note>().is_err());
    }

    #[test]
    fn test_is_white() {
        for (name, white) in [
            ("c4", true),
            ("cs4", false),
            ("d4", true),
            ("ds4", false),
            ("e4", true),
            ("f4", true),
            ("b4", true),
            ("as4", false),
        ] {
            let note: Note = name.parse().unwrap();
            assert_eq!(note.is_white(), white, "{}", name);
        }
    }

    #[test]
    fn test_display_round_trip() {
        for name in ["c4", "cs4", "a0", "b7"] {
            let note: Note = name.parse().unwrap();
            assert_eq!(note.to_string(), name);
        }
    }
}
