//! DGA domain analysis
//!
//! Algorithmically generated domains read like line noise: high entropy,
//! consonant-heavy, digit-laced second-level labels under throwaway TLDs.
//! Each lexical signal contributes a fixed weight to the suspicion score.

use std::collections::{HashMap, HashSet};

use serde_json::json;

const ENTROPY_THRESHOLD: f64 = 3.5;
const MIN_SLD_LENGTH: usize = 8;
const MAX_CONSONANT_RATIO: f64 = 0.8;
const MIN_VOWEL_RATIO: f64 = 0.1;
const MAX_DIGIT_RATIO: f64 = 0.3;
const DGA_THRESHOLD: f64 = 0.5;

const KNOWN_TLDS: [&str; 14] = [
    "com", "org", "net", "edu", "gov", "mil", "int", "io", "co", "ai", "app", "dev", "cloud",
    "tech",
];

const VOWELS: [char; 5] = ['a', 'e', 'i', 'o', 'u'];

/// Lexical verdict on one domain name
#[derive(Debug, Clone)]
pub struct DgaAnalysis {
    pub is_dga: bool,
    /// 0.0-1.0
    pub confidence: f64,
    pub entropy: f64,
    pub reason: String,
    pub characteristics: HashMap<String, serde_json::Value>,
}

impl DgaAnalysis {
    fn negative(reason: &str) -> Self {
        Self {
            is_dga: false,
            confidence: 0.0,
            entropy: 0.0,
            reason: reason.to_string(),
            characteristics: HashMap::new(),
        }
    }
}

pub fn analyze_domain(domain: &str) -> DgaAnalysis {
    let clean = domain.trim().to_lowercase();
    let parts: Vec<&str> = clean.split('.').collect();

    if parts.len() < 2 {
        return DgaAnalysis::negative("Invalid domain format");
    }

    let sld = parts[parts.len() - 2];
    let tld = parts[parts.len() - 1];

    if sld.len() < MIN_SLD_LENGTH {
        return DgaAnalysis::negative("Domain too short for DGA analysis");
    }

    let entropy = shannon_entropy(sld);
    let consonant_ratio = consonant_ratio(sld);
    let vowel_ratio = vowel_ratio(sld);
    let digit_ratio = digit_ratio(sld);
    let length_score = length_score(sld);
    let ngram_score = ngram_score(sld);

    let mut score = 0.0;
    let mut reasons = Vec::new();

    if entropy > ENTROPY_THRESHOLD {
        score += 0.3;
        reasons.push(format!("High entropy: {:.2}", entropy));
    }
    if consonant_ratio > MAX_CONSONANT_RATIO {
        score += 0.2;
        reasons.push(format!("Unusual consonant ratio: {:.2}", consonant_ratio));
    }
    if vowel_ratio < MIN_VOWEL_RATIO {
        score += 0.15;
        reasons.push(format!("Low vowel ratio: {:.2}", vowel_ratio));
    }
    if digit_ratio > MAX_DIGIT_RATIO {
        score += 0.15;
        reasons.push(format!("High digit ratio: {:.2}", digit_ratio));
    }
    if length_score > 0.5 {
        score += 0.1;
        reasons.push("Unusual length pattern".to_string());
    }
    if ngram_score > 0.6 {
        score += 0.1;
        reasons.push("Random character sequence detected".to_string());
    }
    if !KNOWN_TLDS.contains(&tld) {
        score += 0.05;
    }

    let is_dga = score > DGA_THRESHOLD;
    let mut characteristics = HashMap::new();
    characteristics.insert("entropy".to_string(), json!(entropy));
    characteristics.insert("consonant_ratio".to_string(), json!(consonant_ratio));
    characteristics.insert("vowel_ratio".to_string(), json!(vowel_ratio));
    characteristics.insert("digit_ratio".to_string(), json!(digit_ratio));
    characteristics.insert("length".to_string(), json!(sld.len()));
    characteristics.insert("ngram_score".to_string(), json!(ngram_score));
    characteristics.insert("tld".to_string(), json!(tld));

    DgaAnalysis {
        is_dga,
        confidence: score.clamp(0.0, 1.0),
        entropy,
        reason: if is_dga {
            format!("DGA detected: {}", reasons.join(", "))
        } else {
            "Domain appears legitimate".to_string()
        },
        characteristics,
    }
}

/// Shannon entropy in bits over the character distribution
pub fn shannon_entropy(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let length = text.chars().count() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / length;
            -p * p.log2()
        })
        .sum()
}

fn consonant_ratio(text: &str) -> f64 {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return 0.0;
    }
    let consonants = letters.iter().filter(|c| !VOWELS.contains(c)).count();
    consonants as f64 / letters.len() as f64
}

fn vowel_ratio(text: &str) -> f64 {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return 0.0;
    }
    let vowels = letters.iter().filter(|c| VOWELS.contains(c)).count();
    vowels as f64 / letters.len() as f64
}

fn digit_ratio(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    digits as f64 / text.chars().count() as f64
}

fn length_score(text: &str) -> f64 {
    match text.len() {
        l if l > 30 => 0.8,
        l if l > 20 => 0.5,
        l if l > 15 => 0.3,
        _ => 0.0,
    }
}

/// Unique-trigram ratio minus a repeated-adjacent-character penalty
fn ngram_score(text: &str) -> f64 {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < 3 {
        return 0.0;
    }

    let trigrams: Vec<&[char]> = chars.windows(3).collect();
    let unique: HashSet<&[char]> = trigrams.iter().copied().collect();
    let randomness = unique.len() as f64 / trigrams.len() as f64;

    let repeated = chars.windows(2).filter(|w| w[0] == w[1]).count();
    let penalty = repeated as f64 / (chars.len() - 1).max(1) as f64;

    (randomness - penalty).clamp(0.0, 1.0)
}
