//! Splits a code submission into kernel-directed segments.
//!
//! A line starting with `#!` names the kernel that should run the lines
//! following it, until the next directive. Lines before the first directive
//! belong to the submission's original target.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSegment {
    pub target: Option<String>,
    pub code: String,
}

pub fn split_submission(code: &str) -> Vec<CodeSegment> {
    let mut segments = Vec::new();
    let mut target: Option<String> = None;
    let mut buffer: Vec<&str> = Vec::new();

    let flush = |target: &Option<String>, buffer: &mut Vec<&str>, segments: &mut Vec<CodeSegment>| {
        let code = buffer.join("\n");
        if !code.trim().is_empty() {
            segments.push(CodeSegment {
                target: target.clone(),
                code,
            });
        }
        buffer.clear();
    };

    for line in code.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("#!") {
            flush(&target, &mut buffer, &mut segments);
            target = Some(name.trim().to_string());
        } else {
            buffer.push(line);
        }
    }
    flush(&target, &mut buffer, &mut segments);
    segments
}

/// True when the submission contains at least one `#!` directive.
pub fn has_directives(code: &str) -> bool {
    code.lines().any(|line| line.trim().starts_with("#!"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_code_is_a_single_untargeted_segment() {
        let segments = split_submission("let x = 1;\nx + 1");
        assert_eq!(
            segments,
            vec![CodeSegment {
                target: None,
                code: "let x = 1;\nx + 1".into()
            }]
        );
        assert!(!has_directives("let x = 1;"));
    }

    #[test]
    fn directives_carve_out_targeted_segments() {
        let segments = split_submission("#!csharp\nvar x = 1;\n#!sql\nselect 1");
        assert_eq!(
            segments,
            vec![
                CodeSegment {
                    target: Some("csharp".into()),
                    code: "var x = 1;".into()
                },
                CodeSegment {
                    target: Some("sql".into()),
                    code: "select 1".into()
                },
            ]
        );
    }

    #[test]
    fn leading_code_keeps_the_original_target() {
        let segments = split_submission("first()\n#!sql\nselect 1");
        assert_eq!(segments[0].target, None);
        assert_eq!(segments[0].code, "first()");
        assert_eq!(segments[1].target.as_deref(), Some("sql"));
    }

    #[test]
    fn empty_segments_are_dropped() {
        let segments = split_submission("#!csharp\n\n#!sql\nselect 1");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].target.as_deref(), Some("sql"));
    }
}
