//! Local language detection.
//!
//! Non-Latin scripts decide the language on their own. Latin-script text is
//! scored against small stop-word tables; the winner needs a minimum share
//! of the tokens and a margin over the runner-up, otherwise the configured
//! default is returned.

/// Outcome of one detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// ISO-639-1 code.
    pub language: String,
    /// Share of evidence supporting `language`, in [0, 1].
    pub score: f64,
    /// The default was used because the evidence was too weak.
    pub fallback: bool,
}

const STOP_WORDS: &[(&str, &[&str])] = &[
    (
        "en",
        &[
            "the", "and", "to", "of", "a", "in", "is", "you", "your", "for", "on", "with",
            "this", "that", "please", "my", "we", "i", "it", "be", "are", "have", "can", "our",
            "will", "me", "would", "not", "at", "from", "thank", "thanks", "hi", "hello",
            "regards", "dear", "an", "or", "if", "do", "by", "could", "about",
        ],
    ),
    (
        "es",
        &[
            "el", "la", "los", "las", "de", "que", "y", "en", "un", "una", "por", "para", "con",
            "no", "es", "su", "mi", "gracias", "hola", "favor", "estimado", "saludos", "quiero",
            "necesito", "del", "al", "lo", "se", "muy", "usted",
        ],
    ),
    (
        "fr",
        &[
            "le", "la", "les", "de", "des", "et", "est", "un", "une", "pour", "que", "qui",
            "dans", "avec", "vous", "nous", "je", "merci", "bonjour", "votre", "mon", "pas",
            "sur", "ce", "au", "du", "cordialement",
        ],
    ),
    (
        "de",
        &[
            "der", "die", "das", "und", "ist", "nicht", "ich", "sie", "wir", "mit", "für",
            "auf", "ein", "eine", "zu", "den", "dem", "bitte", "danke", "hallo", "mein", "ihr",
            "ihre", "von", "es", "grüße",
        ],
    ),
    (
        "it",
        &[
            "il", "lo", "gli", "di", "che", "e", "è", "un", "una", "per", "con", "non", "sono",
            "mio", "grazie", "ciao", "buongiorno", "vorrei", "della", "del", "questo", "saluti",
        ],
    ),
    (
        "pt",
        &[
            "o", "os", "as", "de", "que", "e", "em", "um", "uma", "para", "com", "não",
            "obrigado", "obrigada", "olá", "meu", "minha", "por", "você", "gostaria", "do",
            "da", "atenciosamente",
        ],
    ),
    (
        "nl",
        &[
            "de", "het", "een", "en", "van", "ik", "je", "niet", "dat", "op", "te", "met",
            "voor", "bedankt", "hallo", "graag", "mijn", "wij", "u", "alstublieft", "groeten",
        ],
    ),
];

#[derive(Debug, Clone)]
pub struct LanguageDetector {
    default_language: String,
    /// Minimum share of tokens that must be stop words of the winner.
    min_share: f64,
    /// Winner must have at least this many more matches than the runner-up.
    min_margin: usize,
}

impl LanguageDetector {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: default_language.into(),
            min_share: 0.15,
            min_margin: 1,
        }
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// Detect the working language of an email. Never fails.
    pub fn detect(&self, subject: &str, body: &str) -> Detection {
        let text = format!("{subject}\n{body}");

        if let Some((language, score)) = detect_script(&text) {
            return Detection {
                language: language.to_string(),
                score,
                fallback: false,
            };
        }

        match self.score_stop_words(&text) {
            Some((language, score)) => Detection {
                language: language.to_string(),
                score,
                fallback: false,
            },
            None => self.fallback(),
        }
    }

    fn fallback(&self) -> Detection {
        Detection {
            language: self.default_language.clone(),
            score: 0.0,
            fallback: true,
        }
    }

    fn score_stop_words(&self, text: &str) -> Option<(&'static str, f64)> {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphabetic())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return None;
        }

        let mut scores: Vec<(&'static str, usize)> = STOP_WORDS
            .iter()
            .map(|(lang, words)| {
                let hits = tokens.iter().filter(|t| words.contains(t)).count();
                (*lang, hits)
            })
            .collect();
        scores.sort_by(|a, b| b.1.cmp(&a.1));

        let (winner, hits) = scores[0];
        let runner_up = scores.get(1).map(|s| s.1).unwrap_or(0);
        let share = hits as f64 / tokens.len() as f64;

        if hits == 0 || share < self.min_share || hits < runner_up + self.min_margin {
            return None;
        }
        Some((winner, share.min(1.0)))
    }
}

impl Default for LanguageDetector {
    fn default() -> Self {
        Self::new("en")
    }
}

/// Decide non-Latin languages from the dominant script.
fn detect_script(text: &str) -> Option<(&'static str, f64)> {
    let mut latin = 0usize;
    let mut han = 0usize;
    let mut kana = 0usize;
    let mut hangul = 0usize;
    let mut arabic = 0usize;
    let mut hebrew = 0usize;
    let mut cyrillic = 0usize;
    let mut greek = 0usize;
    let mut devanagari = 0usize;
    let mut thai = 0usize;

    for ch in text.chars() {
        let code = ch as u32;
        match code {
            0x3040..=0x30FF => kana += 1,
            0x4E00..=0x9FFF | 0x3400..=0x4DBF => han += 1,
            0xAC00..=0xD7AF | 0x1100..=0x11FF => hangul += 1,
            0x0600..=0x06FF | 0x0750..=0x077F => arabic += 1,
            0x0590..=0x05FF => hebrew += 1,
            0x0400..=0x04FF => cyrillic += 1,
            0x0370..=0x03FF => greek += 1,
            0x0900..=0x097F => devanagari += 1,
            0x0E00..=0x0E7F => thai += 1,
            _ if ch.is_alphabetic() => latin += 1,
            _ => {}
        }
    }

    // Japanese mixes kana with han, so kana wins over han.
    let cjk = han + kana;
    let candidates = [
        (if kana > 0 { "ja" } else { "zh" }, cjk),
        ("ko", hangul),
        ("ar", arabic),
        ("he", hebrew),
        ("ru", cyrillic),
        ("el", greek),
        ("hi", devanagari),
        ("th", thai),
    ];

    let (language, count) = candidates.into_iter().max_by_key(|(_, count)| *count)?;
    if count == 0 || count <= latin {
        return None;
    }
    let total = (count + latin) as f64;
    Some((language, count as f64 / total))
}
