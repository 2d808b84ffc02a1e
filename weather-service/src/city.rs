/// Canonical form of a city name used for cache and history keys.
///
/// Leading and trailing whitespace is dropped, internal runs of whitespace
/// collapse to one space and every word is title-cased, so `"são  paulo"`,
/// `" São Paulo "` and `"SÃO PAULO"` all become `"São Paulo"`. A letter is
/// upper-cased when it follows a non-letter, which keeps `"rio-de-janeiro"`
/// as `"Rio-De-Janeiro"`. Returns `None` for blank input.
pub fn normalize_city(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(title_case(&collapsed))
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_is_letter = false;

    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_is_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_is_letter = true;
        } else {
            out.push(c);
            prev_is_letter = false;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_of_sao_paulo_share_one_key() {
        let expected = Some("São Paulo".to_string());
        assert_eq!(normalize_city("são paulo"), expected);
        assert_eq!(normalize_city(" São Paulo "), expected);
        assert_eq!(normalize_city("SÃO PAULO"), expected);
        assert_eq!(normalize_city("são \t  paulo"), expected);
    }

    #[test]
    fn blank_input_has_no_key() {
        assert_eq!(normalize_city(""), None);
        assert_eq!(normalize_city("   \n"), None);
    }

    #[test]
    fn letters_after_punctuation_are_capitalized() {
        assert_eq!(normalize_city("rio-de-janeiro").as_deref(), Some("Rio-De-Janeiro"));
        assert_eq!(normalize_city("new york 2").as_deref(), Some("New York 2"));
    }
}
