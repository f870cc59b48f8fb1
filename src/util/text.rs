/// テキスト処理ユーティリティ。
///
/// 単語分割、頻出語抽出、文字数ベースの切り詰めを提供します。
use std::collections::HashMap;

use unicode_segmentation::UnicodeSegmentation;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "because", "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "get",
    "got", "had", "has", "have", "he", "her", "here", "him", "his", "how", "i", "if", "in", "into",
    "is", "it", "its", "just", "like", "me", "more", "my", "no", "not", "now", "of", "on", "one",
    "or", "our", "out", "so", "some", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "to", "too", "up", "us", "was", "we", "were", "what", "when", "which",
    "who", "why", "will", "with", "would", "you", "your", "rt", "amp", "https", "http", "www",
    "com",
];

/// UAX#29 の単語境界で分割し、小文字化したトークンを返す。
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(str::to_lowercase)
        .filter(|word| word.chars().any(char::is_alphabetic))
        .collect()
}

#[must_use]
pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// 頻出語を上位 `limit` 件抽出する。
///
/// ストップワードと2文字未満の語は除外し、同頻度は辞書順で安定させる。
#[must_use]
pub fn top_terms<'a, I>(texts: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for token in tokenize(text) {
            if token.chars().count() < 2 || is_stop_word(&token) {
                continue;
            }
            *counts.entry(token).or_default() += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(term, _)| term).collect()
}

/// 書記素クラスタ単位で `max_chars` に切り詰める。
#[must_use]
pub fn truncate_graphemes(text: &str, max_chars: usize) -> String {
    text.graphemes(true).take(max_chars).collect()
}
