//! Line-oriented cleanup of raw model answers before structured parsing.
//!
//! Any line containing one of [`WRAPPER_MARKERS`] is dropped, including data
//! lines that happen to contain a marker phrase.

const CODE_FENCE: &str = "```";

pub const WRAPPER_MARKERS: &[&str] = &[
    "here is the",
    "here's the",
    "the json is",
    "the yaml is",
    "response:",
    "result:",
    "output:",
    "```json",
    "```yaml",
    CODE_FENCE,
];

pub fn sanitize_response(raw: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();

    for line in raw.trim().lines() {
        let normalized = line.trim().to_lowercase();
        if is_wrapper_line(&normalized) {
            continue;
        }
        if kept.is_empty() && normalized.is_empty() {
            continue;
        }
        kept.push(line);
    }

    while let Some(last) = kept.last() {
        let trimmed = last.trim();
        if trimmed.is_empty() || trimmed == CODE_FENCE {
            kept.pop();
        } else {
            break;
        }
    }

    kept.join("\n").trim().to_string()
}

fn is_wrapper_line(normalized: &str) -> bool {
    WRAPPER_MARKERS
        .iter()
        .any(|marker| normalized.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::sanitize_response;

    #[test]
    fn strips_lead_in_and_json_fence() {
        let response = "Here is the JSON:\n```json\n{\"name\": \"test\", \"value\": 123}\n```";
        assert_eq!(
            sanitize_response(response),
            r#"{"name": "test", "value": 123}"#
        );
    }

    #[test]
    fn strips_multiple_wrapper_styles() {
        let response = "\n\nSure! Here's the result you asked for\nResult:\n```yaml\nname: Bob\nage: 25\n```\n\n";
        assert_eq!(sanitize_response(response), "name: Bob\nage: 25");
    }

    #[test]
    fn keeps_interior_blank_lines() {
        let response = "```\n{\n\n  \"a\": 1\n}\n```";
        assert_eq!(sanitize_response(response), "{\n\n  \"a\": 1\n}");
    }

    #[test]
    fn marker_matching_is_case_insensitive() {
        let response = "THE JSON IS:\n[1, 2, 3]";
        assert_eq!(sanitize_response(response), "[1, 2, 3]");
    }

    #[test]
    fn data_lines_containing_markers_are_dropped() {
        let response = "title: Report\noutput: pdf\npages: 3";
        assert_eq!(sanitize_response(response), "title: Report\npages: 3");
    }

    #[test]
    fn sanitizing_twice_matches_sanitizing_once() {
        let samples = [
            "Here is the JSON:\n```json\n{\"name\": \"test\"}\n```",
            "  \n\nkey: value\n\n",
            "plain text with no wrapper",
            "",
            "```\n```",
            "Output:\n- a\n- b\n```\n\n",
        ];

        for sample in samples {
            let once = sanitize_response(sample);
            assert_eq!(sanitize_response(&once), once, "sample: {sample:?}");
        }
    }

    #[test]
    fn empty_and_wrapper_only_input_sanitize_to_empty() {
        assert_eq!(sanitize_response(""), "");
        assert_eq!(sanitize_response("Here is the YAML:\n```yaml\n```"), "");
    }
}
