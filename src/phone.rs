//! Phone number normalization and area-code geography.
//!
//! All lookups run on the canonical E.164 form. Invalid input is rejected
//! here, at the boundary, so the cache and provider layers only ever see
//! well-formed numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DncError, DncResult};

/// A normalized US/Canada phone number in E.164 form (`+1` + 10 digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize a raw input string into canonical E.164.
    ///
    /// Accepts 10-digit national numbers, 11-digit numbers with a leading
    /// `1`, and any punctuation/spacing around them. Everything else is an
    /// `invalid-request`.
    pub fn normalize(raw: &str) -> DncResult<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

        let national = match digits.len() {
            10 => digits,
            11 if digits.starts_with('1') => digits[1..].to_string(),
            _ => {
                return Err(DncError::InvalidRequest(format!(
                    "phone number {raw:?} is not a valid US/Canada number"
                )))
            }
        };

        // NANP: area code and exchange may not start with 0 or 1.
        let first = national.as_bytes()[0];
        let exchange_first = national.as_bytes()[3];
        if !(b'2'..=b'9').contains(&first) || !(b'2'..=b'9').contains(&exchange_first) {
            return Err(DncError::InvalidRequest(format!(
                "phone number {raw:?} has an invalid area code or exchange"
            )));
        }

        Ok(PhoneNumber(format!("+1{national}")))
    }

    /// Canonical E.164 representation, e.g. `+14155551234`.
    pub fn as_e164(&self) -> &str {
        &self.0
    }

    /// Digits only (eleven digits starting with `1`), the MSISDN form.
    pub fn digits(&self) -> &str {
        &self.0[1..]
    }

    /// The 3-digit area code.
    pub fn area_code(&self) -> &str {
        &self.0[2..5]
    }

    /// Primary state (2-letter code) for this number's area code, if the
    /// code is in the static table.
    pub fn state(&self) -> Option<&'static str> {
        state_for_area_code(self.area_code())
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = DncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PhoneNumber::normalize(&s)
    }
}

impl From<PhoneNumber> for String {
    fn from(p: PhoneNumber) -> String {
        p.0
    }
}

/// Map a 3-digit area code to its primary US state.
///
/// Overlay codes map to a single primary state; codes outside the table
/// (Canadian, toll-free, unassigned) return `None` and callers fall back to
/// their configured state list.
pub fn state_for_area_code(code: &str) -> Option<&'static str> {
    let state = match code {
        "205" | "251" | "256" | "334" | "938" => "AL",
        "907" => "AK",
        "480" | "520" | "602" | "623" | "928" => "AZ",
        "479" | "501" | "870" => "AR",
        "209" | "213" | "279" | "310" | "323" | "408" | "415" | "424" | "442" | "510" | "530"
        | "559" | "562" | "619" | "626" | "650" | "657" | "661" | "669" | "707" | "714" | "747"
        | "760" | "805" | "818" | "820" | "831" | "858" | "909" | "916" | "925" | "949" | "951" => {
            "CA"
        }
        "303" | "719" | "720" | "970" => "CO",
        "203" | "475" | "860" | "959" => "CT",
        "302" => "DE",
        "202" => "DC",
        "239" | "305" | "321" | "352" | "386" | "407" | "561" | "689" | "727" | "754" | "772"
        | "786" | "813" | "850" | "863" | "904" | "941" | "954" => "FL",
        "229" | "404" | "470" | "478" | "678" | "706" | "762" | "770" | "912" => "GA",
        "808" => "HI",
        "208" | "986" => "ID",
        "217" | "224" | "309" | "312" | "331" | "447" | "618" | "630" | "708" | "773" | "779"
        | "815" | "847" | "872" => "IL",
        "219" | "260" | "317" | "463" | "574" | "765" | "812" | "930" => "IN",
        "319" | "515" | "563" | "641" | "712" => "IA",
        "316" | "620" | "785" | "913" => "KS",
        "270" | "364" | "502" | "606" | "859" => "KY",
        "225" | "318" | "337" | "504" | "985" => "LA",
        "207" => "ME",
        "240" | "301" | "410" | "443" | "667" => "MD",
        "339" | "351" | "413" | "508" | "617" | "774" | "781" | "857" | "978" => "MA",
        "231" | "248" | "269" | "313" | "517" | "586" | "616" | "679" | "734" | "810" | "906"
        | "947" | "989" => "MI",
        "218" | "320" | "507" | "612" | "651" | "763" | "952" => "MN",
        "228" | "601" | "662" | "769" => "MS",
        "314" | "417" | "573" | "636" | "660" | "816" => "MO",
        "406" => "MT",
        "308" | "402" | "531" => "NE",
        "702" | "725" | "775" => "NV",
        "603" => "NH",
        "201" | "551" | "609" | "640" | "732" | "848" | "856" | "862" | "908" | "973" => "NJ",
        "505" | "575" => "NM",
        "212" | "315" | "332" | "347" | "516" | "518" | "585" | "607" | "631" | "646" | "680"
        | "716" | "718" | "838" | "845" | "914" | "917" | "929" | "934" => "NY",
        "252" | "336" | "704" | "743" | "828" | "910" | "919" | "980" | "984" => "NC",
        "701" => "ND",
        "216" | "220" | "234" | "330" | "380" | "419" | "440" | "513" | "567" | "614" | "740"
        | "937" => "OH",
        "405" | "539" | "580" | "918" => "OK",
        "458" | "503" | "541" | "971" => "OR",
        "215" | "223" | "267" | "272" | "412" | "445" | "484" | "570" | "610" | "717" | "724"
        | "814" | "878" => "PA",
        "401" => "RI",
        "803" | "839" | "843" | "854" | "864" => "SC",
        "605" => "SD",
        "423" | "615" | "629" | "731" | "865" | "901" | "931" => "TN",
        "210" | "214" | "254" | "281" | "325" | "346" | "361" | "409" | "430" | "432" | "469"
        | "512" | "682" | "713" | "726" | "737" | "806" | "817" | "830" | "832" | "903" | "915"
        | "936" | "940" | "956" | "972" | "979" => "TX",
        "385" | "435" | "801" => "UT",
        "802" => "VT",
        "276" | "434" | "540" | "571" | "703" | "757" | "804" => "VA",
        "206" | "253" | "360" | "425" | "509" | "564" => "WA",
        "304" | "681" => "WV",
        "262" | "414" | "534" | "608" | "715" | "920" => "WI",
        "307" => "WY",
        _ => return None,
    };
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ten_digit() {
        let p = PhoneNumber::normalize("4155551234").unwrap();
        assert_eq!(p.as_e164(), "+14155551234");
        assert_eq!(p.digits(), "14155551234");
        assert_eq!(p.area_code(), "415");
    }

    #[test]
    fn test_normalize_formatted_input() {
        let p = PhoneNumber::normalize("(415) 555-1234").unwrap();
        assert_eq!(p.as_e164(), "+14155551234");

        let p = PhoneNumber::normalize("+1 415 555 1234").unwrap();
        assert_eq!(p.as_e164(), "+14155551234");

        let p = PhoneNumber::normalize("1-415-555-1234").unwrap();
        assert_eq!(p.as_e164(), "+14155551234");
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        assert!(PhoneNumber::normalize("").is_err());
        assert!(PhoneNumber::normalize("555-1234").is_err());
        assert!(PhoneNumber::normalize("+44 20 7946 0958").is_err());
        // area code starting with 1 is not a valid NANP code
        assert!(PhoneNumber::normalize("1155551234").is_err());
        // exchange starting with 0
        assert!(PhoneNumber::normalize("4150551234").is_err());
    }

    #[test]
    fn test_area_code_to_state() {
        assert_eq!(state_for_area_code("415"), Some("CA"));
        assert_eq!(state_for_area_code("212"), Some("NY"));
        assert_eq!(state_for_area_code("512"), Some("TX"));
        assert_eq!(state_for_area_code("907"), Some("AK"));
        assert_eq!(state_for_area_code("800"), None);
    }

    #[test]
    fn test_state_accessor() {
        let p = PhoneNumber::normalize("+14155551234").unwrap();
        assert_eq!(p.state(), Some("CA"));
    }

    #[test]
    fn test_serde_round_trip() {
        let p = PhoneNumber::normalize("+14155551234").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"+14155551234\"");
        let back: PhoneNumber = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
