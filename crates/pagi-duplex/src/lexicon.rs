//! Per-language backchannel and stop-intent lexicons with fuzzy matching.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Es,
    Fr,
    De,
    It,
    Pt,
    Nl,
    Ru,
    Ja,
    Zh,
    Ko,
    Hi,
    Ar,
    Tr,
    Pl,
    Sv,
}

impl Language {
    pub const ALL: [Language; 16] = [
        Language::En,
        Language::Es,
        Language::Fr,
        Language::De,
        Language::It,
        Language::Pt,
        Language::Nl,
        Language::Ru,
        Language::Ja,
        Language::Zh,
        Language::Ko,
        Language::Hi,
        Language::Ar,
        Language::Tr,
        Language::Pl,
        Language::Sv,
    ];

    /// Parse a BCP-47 tag by its primary subtag. Unknown languages fall back to English.
    pub fn from_tag(tag: &str) -> Self {
        let primary = tag
            .split(['-', '_'])
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match primary.as_str() {
            "es" => Self::Es,
            "fr" => Self::Fr,
            "de" => Self::De,
            "it" => Self::It,
            "pt" => Self::Pt,
            "nl" => Self::Nl,
            "ru" => Self::Ru,
            "ja" => Self::Ja,
            "zh" | "cmn" | "yue" => Self::Zh,
            "ko" => Self::Ko,
            "hi" => Self::Hi,
            "ar" => Self::Ar,
            "tr" => Self::Tr,
            "pl" => Self::Pl,
            "sv" => Self::Sv,
            _ => Self::En,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::De => "de",
            Self::It => "it",
            Self::Pt => "pt",
            Self::Nl => "nl",
            Self::Ru => "ru",
            Self::Ja => "ja",
            Self::Zh => "zh",
            Self::Ko => "ko",
            Self::Hi => "hi",
            Self::Ar => "ar",
            Self::Tr => "tr",
            Self::Pl => "pl",
            Self::Sv => "sv",
        }
    }

    /// Short acknowledgements that must not interrupt the assistant.
    pub fn backchannels(&self) -> &'static [&'static str] {
        match self {
            Self::En => &[
                "yeah", "yes", "yep", "yup", "uh huh", "mhm", "mm", "mm hmm", "hmm", "ok", "okay",
                "okey", "right", "sure", "i see", "got it", "cool", "alright", "nice", "true", "exactly",
            ],
            Self::Es => &["sí", "si", "vale", "claro", "ajá", "aja", "ya", "bueno", "entiendo", "okey", "exacto"],
            Self::Fr => &["oui", "ouais", "d'accord", "daccord", "ok", "hum", "ah oui", "je vois", "voilà", "exactement"],
            Self::De => &["ja", "genau", "okay", "ok", "mhm", "aha", "stimmt", "klar", "verstehe", "richtig"],
            Self::It => &["sì", "si", "certo", "ok", "va bene", "esatto", "capito", "giusto", "ah"],
            Self::Pt => &["sim", "é", "tá", "ta", "certo", "ok", "uhum", "claro", "entendi", "exato"],
            Self::Nl => &["ja", "oké", "oke", "ok", "precies", "klopt", "hm", "inderdaad", "juist"],
            Self::Ru => &["да", "ага", "угу", "понятно", "ясно", "ладно", "хорошо", "конечно", "ок"],
            Self::Ja => &["はい", "うん", "ええ", "そうですね", "なるほど", "そう", "へえ", "hai", "un", "naruhodo"],
            Self::Zh => &["嗯", "对", "是", "好", "好的", "对对", "是的", "明白", "en", "dui", "hao"],
            Self::Ko => &["네", "응", "예", "그래", "맞아", "아", "그렇죠", "ne", "eung"],
            Self::Hi => &["हाँ", "हां", "जी", "अच्छा", "ठीक है", "हम्म", "haan", "ji", "accha", "theek hai"],
            Self::Ar => &["نعم", "أيوه", "ايوه", "طيب", "صح", "تمام", "اه", "naam", "tayyib", "tamam"],
            Self::Tr => &["evet", "tamam", "hı hı", "he", "anladım", "doğru", "peki", "aynen"],
            Self::Pl => &["tak", "no", "aha", "dobrze", "jasne", "okej", "mhm", "rozumiem", "właśnie"],
            Self::Sv => &["ja", "japp", "okej", "precis", "mm", "visst", "just det", "absolut", "aha"],
        }
    }

    /// Words that signal the user wants the assistant to stop.
    pub fn stop_words(&self) -> &'static [&'static str] {
        match self {
            Self::En => &["stop", "wait", "hold on", "hang on", "no", "cancel", "quiet", "shut up", "enough", "pause"],
            Self::Es => &["para", "espera", "alto", "no", "basta", "cancela", "detente", "cállate"],
            Self::Fr => &["arrête", "arrete", "stop", "attends", "non", "attendez", "annule", "tais-toi", "assez"],
            Self::De => &["stopp", "stop", "halt", "warte", "nein", "moment", "hör auf", "abbrechen", "ruhe"],
            Self::It => &["basta", "aspetta", "fermati", "stop", "no", "annulla", "zitto", "alt"],
            Self::Pt => &["para", "pare", "espera", "não", "nao", "chega", "cancela", "calma"],
            Self::Nl => &["stop", "wacht", "nee", "hou op", "annuleer", "genoeg", "momentje"],
            Self::Ru => &["стоп", "подожди", "нет", "хватит", "стой", "отмена", "замолчи"],
            Self::Ja => &["待って", "まって", "ストップ", "やめて", "いいえ", "ちょっと", "matte", "yamete"],
            Self::Zh => &["停", "等等", "等一下", "不要", "别说了", "停下", "ting", "dengdeng"],
            Self::Ko => &["잠깐", "멈춰", "그만", "아니", "아니요", "스톱", "jamkkan", "geuman"],
            Self::Hi => &["रुको", "रुकिए", "नहीं", "बस", "ruko", "nahi", "bas"],
            Self::Ar => &["توقف", "انتظر", "لا", "كفى", "stop", "wa'if"],
            Self::Tr => &["dur", "bekle", "hayır", "yeter", "iptal", "sus"],
            Self::Pl => &["stop", "czekaj", "nie", "przestań", "dość", "anuluj", "chwila"],
            Self::Sv => &["stopp", "vänta", "nej", "sluta", "avbryt", "tyst"],
        }
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Shortest token that may match an entry with a one-edit slip.
const FUZZY_MIN_CHARS: usize = 5;

/// Exact, or a one-edit slip on a long token that keeps the entry's first two letters.
/// Short words like "tool" or "tree" and rhymes like "light" stay content words.
fn token_matches(token: &str, entry: &str) -> bool {
    if token == entry {
        return true;
    }
    if token.chars().count() < FUZZY_MIN_CHARS || entry.chars().count() < FUZZY_MIN_CHARS - 1 {
        return false;
    }
    let prefix = |s: &str| s.chars().take(2).collect::<String>();
    prefix(token) == prefix(entry) && edit_distance(token, entry) <= 1
}

fn phrase_matches(fragment: &str, entry: &str) -> bool {
    let a: Vec<&str> = fragment.split(' ').collect();
    let b: Vec<&str> = entry.split(' ').collect();
    a.len() == b.len() && a.iter().zip(&b).all(|(t, e)| token_matches(t, e))
}

/// Whether `fragment` consists only of backchannel entries, allowing a one-edit slip on
/// longer tokens ("yeahh", "alrigt") and repetition ("yeah yeah").
pub fn is_backchannel(fragment: &str, language: Language) -> bool {
    let normalized = normalize(fragment);
    if normalized.is_empty() {
        return false;
    }
    let entries = language.backchannels();
    let tokens: Vec<&str> = normalized.split(' ').collect();

    // Greedy cover: at each position try the longest entry first.
    let mut i = 0;
    'outer: while i < tokens.len() {
        for len in (1..=tokens.len() - i).rev() {
            let window = tokens[i..i + len].join(" ");
            if entries.iter().any(|e| phrase_matches(&window, e)) {
                i += len;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

/// Whether `fragment` contains a stop-intent keyword or phrase.
pub fn has_stop_intent(fragment: &str, language: Language) -> bool {
    let normalized = normalize(fragment);
    if normalized.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = normalized.split(' ').collect();
    language.stop_words().iter().any(|entry| {
        // Scripts without spaces: substring match on the whole fragment.
        if entry.chars().all(is_cjk) {
            return normalized.contains(entry);
        }
        let len = entry.split(' ').count();
        len <= tokens.len() && tokens.windows(len).any(|w| w.join(" ") == *entry)
    })
}

/// Word count after normalization. Scripts without spaces count characters in groups of two.
pub fn word_count(fragment: &str) -> usize {
    let normalized = normalize(fragment);
    normalized
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(|t| {
            if t.chars().all(is_cjk) {
                t.chars().count().div_ceil(2)
            } else {
                1
            }
        })
        .sum()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x3040..=0x30FF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF)
}
