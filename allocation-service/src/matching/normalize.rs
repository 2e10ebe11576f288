//! Payee name normalization and similarity.
//!
//! Bank feeds mangle names in predictable ways: case, punctuation, honorifics
//! and company/location suffixes appended by the sending bank. Both sides of a
//! comparison are normalized before any distance is computed.

const HONORIFICS: &[&str] = &["MR", "MRS", "MS", "MISS", "DR", "PROF"];

/// Multi-word entries are listed as token sequences.
const SUFFIXES: &[&[&str]] = &[
    &["PTY"],
    &["LTD"],
    &["LIMITED"],
    &["CC"],
    &["INC"],
    &["LLC"],
    &["NPC"],
    &["CO"],
    &["CORP"],
    &["PLC"],
    &["SA"],
    &["ZA"],
    &["RSA"],
    &["SOUTH", "AFRICA"],
    &["JHB"],
    &["JOHANNESBURG"],
    &["CPT"],
    &["CAPE", "TOWN"],
    &["DBN"],
    &["DURBAN"],
    &["PTA"],
    &["PRETORIA"],
];

/// Weight of the edit-distance component; the phonetic component gets the rest.
const EDIT_WEIGHT: f64 = 0.8;
const PHONETIC_WEIGHT: f64 = 0.2;

/// Canonical form of a payee or contact name.
///
/// Never strips the last remaining token, so a name consisting only of a
/// suffix ("CO") or an honorific survives normalization.
pub fn normalize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                ' '
            }
        })
        .collect();

    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();

    while tokens.len() > 1 && HONORIFICS.contains(&tokens[0]) {
        tokens.remove(0);
    }

    loop {
        let stripped = SUFFIXES.iter().find(|suffix| {
            tokens.len() > suffix.len() && tokens[tokens.len() - suffix.len()..] == ***suffix
        });
        match stripped {
            Some(suffix) => tokens.truncate(tokens.len() - suffix.len()),
            None => break,
        }
    }

    tokens.join(" ")
}

/// American Soundex code of a single token. Tokens without letters are
/// their own key.
fn soundex(token: &str) -> String {
    fn code(c: char) -> Option<char> {
        match c {
            'B' | 'F' | 'P' | 'V' => Some('1'),
            'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
            'D' | 'T' => Some('3'),
            'L' => Some('4'),
            'M' | 'N' => Some('5'),
            'R' => Some('6'),
            _ => None,
        }
    }

    let letters: Vec<char> = token
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let Some(&first) = letters.first() else {
        return token.to_string();
    };

    let mut key = String::with_capacity(4);
    key.push(first);
    let mut last = code(first);
    for &c in &letters[1..] {
        if key.len() == 4 {
            break;
        }
        match c {
            // H and W do not separate letters with the same code.
            'H' | 'W' => continue,
            _ => {
                let current = code(c);
                if let Some(digit) = current {
                    if current != last {
                        key.push(digit);
                    }
                }
                last = current;
            }
        }
    }
    while key.len() < 4 {
        key.push('0');
    }
    key
}

/// Phonetic key of an already normalized name.
pub fn phonetic_key(normalized: &str) -> String {
    normalized
        .split_whitespace()
        .map(soundex)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity of two raw names in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let edit = strsim::normalized_levenshtein(&a, &b);
    let phonetic = if phonetic_key(&a) == phonetic_key(&b) {
        1.0
    } else {
        0.0
    };
    (EDIT_WEIGHT * edit + PHONETIC_WEIGHT * phonetic).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_case_and_punctuation() {
        assert_eq!(normalize("  jane-smith, "), "JANE SMITH");
    }

    #[test]
    fn test_normalize_strips_honorifics() {
        assert_eq!(normalize("Mrs. J. Smith"), "J SMITH");
        assert_eq!(normalize("Dr Prof Nkosi"), "NKOSI");
    }

    #[test]
    fn test_normalize_strips_suffixes_repeatedly() {
        assert_eq!(normalize("Acme Trading (Pty) Ltd"), "ACME TRADING");
        assert_eq!(normalize("Brightside CC Cape Town"), "BRIGHTSIDE");
        assert_eq!(normalize("Nkosi Holdings South Africa"), "NKOSI HOLDINGS");
    }

    #[test]
    fn test_normalize_keeps_last_token() {
        assert_eq!(normalize("Co"), "CO");
        assert_eq!(normalize("Dr"), "DR");
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" .,- "), "");
    }

    #[test]
    fn test_soundex_codes() {
        assert_eq!(soundex("ROBERT"), "R163");
        assert_eq!(soundex("RUPERT"), "R163");
        assert_eq!(soundex("ASHCRAFT"), "A261");
        assert_eq!(soundex("TYMCZAK"), "T522");
        assert_eq!(soundex("PFISTER"), "P236");
        assert_eq!(soundex("A"), "A000");
        assert_eq!(soundex("2024"), "2024");
    }

    #[test]
    fn test_similarity_identical_after_normalization() {
        assert_eq!(similarity("Mr J Smith", "J. SMITH"), 1.0);
    }

    #[test]
    fn test_similarity_empty_is_zero() {
        assert_eq!(similarity("", "Jane Smith"), 0.0);
        assert_eq!(similarity("Jane Smith", "---"), 0.0);
    }

    #[test]
    fn test_similarity_is_symmetric_and_bounded() {
        let pairs = [
            ("Jane Smith", "Jayne Smyth"),
            ("Thabo Nkosi", "T Nkosi"),
            ("Acme", "Zenith Holdings"),
        ];
        for (a, b) in pairs {
            let ab = similarity(a, b);
            assert_eq!(ab, similarity(b, a));
            assert!((0.0..=1.0).contains(&ab));
        }
    }

    #[test]
    fn test_similarity_rewards_phonetic_match() {
        // Same Soundex keys, one substitution apart.
        let close = similarity("Jane Smith", "Jane Smyth");
        assert!(close > 0.9, "got {close}");
        assert!(similarity("Jane Smith", "Peter Brown") < 0.3);
    }
}
