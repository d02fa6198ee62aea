//! `vendor/modules.txt` carries `# module [version] => path` annotations that
//! duplicate go.mod replaces and must agree with them.

use std::collections::BTreeMap;

/// Substitute the target of every annotated replace line whose module has an
/// entry in `replacements`. Lines for other modules are left untouched.
pub fn rewrite_modules_txt(text: &str, replacements: &BTreeMap<String, String>) -> String {
    if replacements.is_empty() {
        return text.to_string();
    }

    let lines: Vec<String> = text
        .split('\n')
        .map(|line| rewrite_line(line, replacements).unwrap_or_else(|| line.to_string()))
        .collect();
    lines.join("\n")
}

fn rewrite_line(line: &str, replacements: &BTreeMap<String, String>) -> Option<String> {
    let tail = line.strip_prefix("# ")?;
    let (lhs, _) = tail.split_once("=>")?;
    let mut parts = lhs.trim().splitn(2, ' ');
    let module = parts.next().filter(|m| !m.is_empty())?;
    let version = parts.next().map(str::trim).filter(|v| !v.is_empty());
    let target = replacements.get(module)?;

    let mut out = format!("# {module}");
    if let Some(version) = version {
        out.push(' ');
        out.push_str(version);
    }
    out.push_str(" => ");
    out.push_str(target);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_annotated_targets() {
        let text = "# example.com/lib v1.0.0 => ../lib\n## explicit\nexample.com/lib\n# example.com/other => ./other\n";
        let out = rewrite_modules_txt(text, &map(&[("example.com/lib", "/shadow/lib")]));
        assert_eq!(
            out,
            "# example.com/lib v1.0.0 => /shadow/lib\n## explicit\nexample.com/lib\n# example.com/other => ./other\n"
        );
    }

    #[test]
    fn unannotated_lines_kept() {
        let text = "# example.com/lib v1.0.0\nexample.com/lib\n";
        let out = rewrite_modules_txt(text, &map(&[("example.com/lib", "/shadow/lib")]));
        assert_eq!(out, text);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let replacements = map(&[("example.com/lib", "/shadow/lib")]);
        let once = rewrite_modules_txt("# example.com/lib => ../lib\n", &replacements);
        let twice = rewrite_modules_txt(&once, &replacements);
        assert_eq!(once, twice);
    }
}
