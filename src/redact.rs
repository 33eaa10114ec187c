//! PII masking for conversation text.
//!
//! [`mask`] runs an ordered pipeline of pure substitution stages:
//!
//! 1. compound addresses (city/district/neighborhood, road name + number)
//! 2. region keywords and the characters attached to them
//! 3. phone numbers
//! 4. account-like digit runs (8 to 14 digits)
//!
//! Addresses go first because region keywords (`강남구`, `서울`) also occur
//! inside them; masking the keyword first would leave fragments the address
//! patterns no longer recognize. No mask token contains a digit or a Hangul
//! syllable, so running the pipeline twice changes nothing.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

pub const ADDRESS_MASK: &str = "***";
pub const PHONE_MASK: &str = "***-****-****";
pub const ACCOUNT_MASK: &str = "************";

const REGION_KEYWORDS: &[&str] = &[
    "서울", "경기", "부산", "대구", "인천", "광주", "대전", "울산", "세종", "제주", "강남구",
    "서초구", "송파구", "마포구", "용산구", "종로구", "중구", "성동구", "영등포구", "동작구",
    "구로구", "노원구", "기흥구",
];

static ADDRESS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // 용인시 기흥구 보정동, 수원시 영통구 매탄3동
        r"[가-힣]{2,}(?:시|군)\s?[가-힣]+구\s?[가-힣0-9]+동",
        // 강남구 역삼동
        r"[가-힣]{2,}구\s?[가-힣0-9]+동",
        // 테헤란로 123, 백현로10길 5
        r"[가-힣0-9]{2,}(?:로|길)\s*[0-9]+(?:-[0-9]+)?",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static REGION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternation = REGION_KEYWORDS.join("|");
    Regex::new(&format!(r"(?:{})[^\s,.]*", alternation)).expect("valid regex")
});

static PHONE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // +82 10-1234-5678
        r"\+82[-. ]?1[016789][-. ]?[0-9]{3,4}[-. ]?[0-9]{4}",
        // 010-1234-5678, 010 1234 5678, 010.1234.5678, 01012345678
        r"01[016789][-. ]?[0-9]{3,4}[-. ]?[0-9]{4}",
        // 02-123-4567, 031)123-4567
        r"0(?:2|[3-6][1-5])[-. )][0-9]{3,4}[-. ][0-9]{4}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static ACCOUNT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]{8,14}").expect("valid regex"));

/// One substitution stage of the pipeline.
struct Stage {
    patterns: &'static [Regex],
    mask: &'static str,
    /// Only replace matches not touching another ASCII digit.
    digit_delimited: bool,
}

impl Stage {
    fn apply(&self, text: String) -> String {
        self.patterns.iter().fold(text, |acc, re| {
            if self.digit_delimited {
                replace_digit_delimited(re, &acc, self.mask)
            } else {
                re.replace_all(&acc, self.mask).into_owned()
            }
        })
    }
}

fn replace_digit_delimited(re: &Regex, text: &str, mask: &str) -> String {
    re.replace_all(text, |caps: &Captures| {
        let Some(m) = caps.get(0) else {
            return String::new();
        };
        let before = text[..m.start()].chars().next_back();
        let after = text[m.end()..].chars().next();
        let touches_digit = |c: Option<char>| c.is_some_and(|c| c.is_ascii_digit());
        if touches_digit(before) || touches_digit(after) {
            m.as_str().to_string()
        } else {
            mask.to_string()
        }
    })
    .into_owned()
}

/// Ordered PII masking pipeline.
pub struct PiiRedactor {
    stages: Vec<Stage>,
}

impl Default for PiiRedactor {
    fn default() -> Self {
        Self {
            stages: vec![
                Stage {
                    patterns: ADDRESS_PATTERNS.as_slice(),
                    mask: ADDRESS_MASK,
                    digit_delimited: false,
                },
                Stage {
                    patterns: std::slice::from_ref(&*REGION_PATTERN),
                    mask: ADDRESS_MASK,
                    digit_delimited: false,
                },
                Stage {
                    patterns: PHONE_PATTERNS.as_slice(),
                    mask: PHONE_MASK,
                    digit_delimited: true,
                },
                Stage {
                    patterns: std::slice::from_ref(&*ACCOUNT_PATTERN),
                    mask: ACCOUNT_MASK,
                    digit_delimited: true,
                },
            ],
        }
    }
}

impl PiiRedactor {
    pub fn mask(&self, text: &str) -> String {
        self.stages
            .iter()
            .fold(text.to_string(), |acc, stage| stage.apply(acc))
    }
}

static DEFAULT_REDACTOR: Lazy<PiiRedactor> = Lazy::new(PiiRedactor::default);

/// Mask PII in `text` with the default pipeline.
pub fn mask(text: &str) -> String {
    DEFAULT_REDACTOR.mask(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(index: usize, text: &str) -> String {
        PiiRedactor::default().stages[index].apply(text.to_string())
    }

    #[test]
    fn phone_is_masked_and_surroundings_kept() {
        assert_eq!(mask("010-1234-5678 문의"), "***-****-**** 문의");
    }

    #[test]
    fn phone_separator_styles() {
        for input in [
            "010 1234 5678",
            "010.1234.5678",
            "01012345678",
            "011-123-4567",
            "+82 10-1234-5678",
            "02-123-4567",
        ] {
            assert_eq!(stage(2, input), PHONE_MASK, "input: {input}");
        }
    }

    #[test]
    fn account_digits_are_masked() {
        assert_eq!(
            mask("계좌 1234567890 로 환불 요청"),
            "계좌 ************ 로 환불 요청"
        );
    }

    #[test]
    fn short_and_overlong_digit_runs_are_kept() {
        assert_eq!(stage(3, "주문 1234567"), "주문 1234567");
        assert_eq!(stage(3, "1234567890123456"), "1234567890123456");
    }

    #[test]
    fn compound_address_is_masked_whole() {
        assert_eq!(stage(0, "용인시 기흥구 보정동 살아요"), "*** 살아요");
        assert_eq!(stage(0, "강남구 역삼동"), "***");
        assert_eq!(stage(0, "테헤란로 123 건물"), "*** 건물");
    }

    #[test]
    fn region_keyword_takes_attached_characters() {
        assert_eq!(stage(1, "서울특별시에서 주문"), "*** 주문");
        assert_eq!(stage(1, "부산, 대구"), "***, ***");
    }

    #[test]
    fn address_stage_runs_before_region_stage() {
        // The region keyword inside the address must not split it.
        assert_eq!(mask("강남구 역삼동 배송"), "*** 배송");
        assert_eq!(mask("서울시 강남구 역삼동 123"), "*** 123");
    }

    #[test]
    fn mask_is_idempotent() {
        let samples = [
            "010-1234-5678 문의",
            "계좌 1234567890, 연락처 01098765432",
            "용인시 기흥구 보정동 테헤란로 12-3",
            "서울 강남구 역삼동 거주, 02-555-1234",
            "010-1234-567812345678",
            "0101234567890123456789",
            "환불 요청합니다",
            "",
            "***-****-**** ************ ***",
        ];
        for s in samples {
            let once = mask(s);
            assert_eq!(mask(&once), once, "input: {s}");
        }
    }
}
