//! Apache httpd.conf parsing: line tokeniser, block tree, and
//! `Include`/`IncludeOptional` expansion with glob patterns.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{GatewayError, GatewayResult};

const MAX_INCLUDE_DEPTH: usize = 10;

/// Secondary search root for includes that do not resolve next to the
/// configuration file. Mirrors the usual Apache layout.
const APACHE_FALLBACK_ROOT: &str = "/etc/httpd";

/// A node in the parsed configuration tree. The root node carries global
/// directives; block directives (`<VirtualHost>`, `<Directory>`, ...) become
/// children.
#[derive(Debug, Clone, Default)]
pub struct ConfigNode {
    pub kind: String,
    pub arguments: Vec<String>,
    /// Simple directives in document order, one entry per line.
    pub directives: Vec<(String, Vec<String>)>,
    pub children: Vec<ConfigNode>,
}

impl ConfigNode {
    fn new(kind: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            arguments,
            ..ConfigNode::default()
        }
    }

    /// First argument of the first occurrence of a directive, matched
    /// case-insensitively the way Apache matches directive names.
    pub fn directive(&self, name: &str) -> Option<&str> {
        self.directive_args(name)
            .and_then(|args| args.first())
            .map(String::as_str)
    }

    pub fn directive_args(&self, name: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(directive, _)| directive.eq_ignore_ascii_case(name))
            .map(|(_, args)| args.as_slice())
    }

    /// Argument lists of every occurrence of a directive.
    pub fn all_directives(&self, name: &str) -> Vec<&[String]> {
        self.directives
            .iter()
            .filter(|(directive, _)| directive.eq_ignore_ascii_case(name))
            .map(|(_, args)| args.as_slice())
            .collect()
    }

    pub fn children_of(&self, kinds: &[&str]) -> Vec<&ConfigNode> {
        self.children
            .iter()
            .filter(|child| kinds.iter().any(|k| child.kind.eq_ignore_ascii_case(k)))
            .collect()
    }
}

enum Line {
    Open { name: String, args: Vec<String> },
    Close { name: String },
    Simple { name: String, args: Vec<String> },
}

/// Parse a configuration file and every file it includes into one tree.
/// Included virtual hosts and directives are appended to the root node.
pub fn parse_tree(path: &Path) -> GatewayResult<ConfigNode> {
    let mut visited = HashSet::new();
    parse_with_includes(path, 0, &mut visited, true)
}

fn parse_with_includes(
    path: &Path,
    depth: usize,
    visited: &mut HashSet<PathBuf>,
    missing_is_error: bool,
) -> GatewayResult<ConfigNode> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(GatewayError::MaxIncludeDepth);
    }

    let abs = match path.canonicalize() {
        Ok(abs) => abs,
        Err(err) if missing_is_error => {
            return Err(GatewayError::Config(format!(
                "cannot open {}: {err}",
                path.display()
            )))
        }
        Err(_) => {
            tracing::warn!(target: "gatehouse::apache", path = %path.display(), "optional include not found");
            return Ok(ConfigNode::new("root", Vec::new()));
        }
    };
    if !visited.insert(abs.clone()) {
        // Already parsed during this load; Apache-style includes simply
        // skip re-entry.
        return Ok(ConfigNode::new("root", Vec::new()));
    }

    let raw = std::fs::read_to_string(&abs)?;
    let base_dir = abs.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut root = parse_source(&raw)?;

    let includes = collect_includes(&root);
    for (directive, pattern) in includes {
        let optional = directive.eq_ignore_ascii_case("IncludeOptional");
        let matches = expand_include_pattern(&pattern, &base_dir);
        if matches.is_empty() {
            if optional || is_glob(&pattern) {
                tracing::warn!(target: "gatehouse::apache", %pattern, "no files matched include pattern");
                continue;
            }
            return Err(GatewayError::Config(format!(
                "include pattern matched no files: {pattern}"
            )));
        }
        for file in matches {
            let included = parse_with_includes(&file, depth + 1, visited, !optional)?;
            root.directives.extend(included.directives);
            root.children.extend(included.children);
        }
    }

    Ok(root)
}

fn collect_includes(node: &ConfigNode) -> Vec<(String, String)> {
    let mut includes = Vec::new();
    for (name, args) in &node.directives {
        if name.eq_ignore_ascii_case("Include") || name.eq_ignore_ascii_case("IncludeOptional") {
            for arg in args {
                includes.push((name.clone(), arg.clone()));
            }
        }
    }
    for child in &node.children {
        includes.extend(collect_includes(child));
    }
    includes
}

/// Parse one file's text into a tree without touching includes.
pub fn parse_source(source: &str) -> GatewayResult<ConfigNode> {
    let mut root = ConfigNode::new("root", Vec::new());
    // Index path into the tree under construction; the borrow checker rules
    // out a stack of &mut nodes.
    let mut stack: Vec<usize> = Vec::new();
    // Depth of `<IfModule>`/`<If>` nesting whose contents are dropped.
    let mut skip_depth = 0usize;

    for raw_line in source.lines() {
        let Some(line) = tokenize_line(raw_line) else {
            continue;
        };

        if skip_depth > 0 {
            match line {
                Line::Open { .. } => skip_depth += 1,
                Line::Close { .. } => skip_depth -= 1,
                Line::Simple { .. } => {}
            }
            continue;
        }

        match line {
            Line::Open { name, args } => {
                // <IfModule>, <If>, <IfDefine>, ... — conditional contents
                // are dropped; we cannot know which modules are loaded.
                if name.to_ascii_lowercase().starts_with("if") {
                    skip_depth = 1;
                    continue;
                }
                let node = ConfigNode::new(name, args);
                let parent = node_at(&mut root, &stack);
                parent.children.push(node);
                let index = parent.children.len() - 1;
                stack.push(index);
            }
            Line::Close { .. } => {
                stack.pop();
            }
            Line::Simple { name, args } => {
                node_at(&mut root, &stack).directives.push((name, args));
            }
        }
    }

    Ok(root)
}

fn node_at<'a>(root: &'a mut ConfigNode, stack: &[usize]) -> &'a mut ConfigNode {
    let mut node = root;
    for &index in stack {
        node = &mut node.children[index];
    }
    node
}

fn tokenize_line(raw: &str) -> Option<Line> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let line = strip_inline_comment(trimmed);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix("</") {
        let name = rest.trim_end_matches('>').trim().to_string();
        return Some(Line::Close { name });
    }
    if let Some(rest) = line.strip_prefix('<') {
        let inner = rest.trim_end_matches('>').trim();
        let mut parts = inner.splitn(2, char::is_whitespace);
        let name = parts.next()?.to_string();
        let args = parts
            .next()
            .map(parse_arguments)
            .unwrap_or_default();
        return Some(Line::Open { name, args });
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let name = parts.next()?.to_string();
    let args = parts.next().map(parse_arguments).unwrap_or_default();
    Some(Line::Simple { name, args })
}

/// Remove a trailing `#` comment that begins outside any quoted run.
fn strip_inline_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let mut quote_char = '\0';
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = ch;
            }
            ch if in_quotes && ch == quote_char => {
                in_quotes = false;
            }
            '#' if !in_quotes => return &line[..idx],
            _ => {}
        }
    }
    line
}

/// Split arguments on whitespace, treating quoted runs as single tokens.
pub fn parse_arguments(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '\0';

    for ch in raw.chars() {
        if (ch == '"' || ch == '\'') && !in_quotes {
            in_quotes = true;
            quote_char = ch;
            continue;
        }
        if in_quotes && ch == quote_char {
            in_quotes = false;
            if !current.is_empty() {
                args.push(std::mem::take(&mut current));
            }
            continue;
        }
        if !in_quotes && ch.is_whitespace() {
            if !current.is_empty() {
                args.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(ch);
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Expand an include pattern against the configuration directory, falling
/// back to the conventional Apache root for patterns that do not resolve.
fn expand_include_pattern(pattern: &str, base_dir: &Path) -> Vec<PathBuf> {
    if !is_glob(pattern) {
        let resolved = resolve_path(pattern, base_dir);
        return if resolved.exists() {
            vec![resolved]
        } else {
            Vec::new()
        };
    }

    let pattern_path = Path::new(pattern);
    let file_pattern = pattern_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir_part = pattern_path.parent().unwrap_or_else(|| Path::new(""));

    let mut search_dirs = Vec::new();
    if pattern_path.is_absolute() {
        search_dirs.push(dir_part.to_path_buf());
    } else {
        search_dirs.push(base_dir.join(dir_part));
        if let Some(parent) = base_dir.parent() {
            search_dirs.push(parent.join(dir_part));
        }
        search_dirs.push(Path::new(APACHE_FALLBACK_ROOT).join(dir_part));
    }

    let Some(glob_re) = glob_to_regex(&file_pattern) else {
        return Vec::new();
    };

    for dir in search_dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut matches: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|entry| glob_re.is_match(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.path())
            .collect();
        if !matches.is_empty() {
            matches.sort();
            return matches;
        }
    }
    Vec::new()
}

fn resolve_path(path: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Translate a `*`/`?` glob into an anchored regex.
fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut source = String::from("^");
    for ch in glob.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn arguments_respect_quotes() {
        assert_eq!(
            parse_arguments(r#"combined "/var/log/access log" other"#),
            vec!["combined", "/var/log/access log", "other"]
        );
        assert_eq!(parse_arguments("'single quoted' rest"), vec!["single quoted", "rest"]);
    }

    #[test]
    fn inline_comments_are_stripped_outside_quotes() {
        let node = parse_source("ServerName example.com # the site\n").unwrap();
        assert_eq!(node.directive("ServerName"), Some("example.com"));

        let node = parse_source("CustomLog \"/logs/a#b.log\" combined\n").unwrap();
        assert_eq!(
            node.directive_args("CustomLog").unwrap(),
            &["/logs/a#b.log".to_string(), "combined".to_string()]
        );
    }

    #[test]
    fn block_structure_nests() {
        let source = r#"
Listen 80
<VirtualHost *:80>
    ServerName one.test
    <Directory "/var/www/one">
        DirectoryIndex index.html
    </Directory>
</VirtualHost>
"#;
        let root = parse_source(source).unwrap();
        assert_eq!(root.directive("Listen"), Some("80"));
        let vhosts = root.children_of(&["VirtualHost"]);
        assert_eq!(vhosts.len(), 1);
        assert_eq!(vhosts[0].arguments, vec!["*:80"]);
        let dirs = vhosts[0].children_of(&["Directory"]);
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].arguments, vec!["/var/www/one"]);
        assert_eq!(dirs[0].directive("DirectoryIndex"), Some("index.html"));
    }

    #[test]
    fn ifmodule_contents_are_dropped() {
        let source = r#"
<IfModule mod_ssl.c>
    Listen 443
    <VirtualHost *:443>
        ServerName hidden.test
    </VirtualHost>
</IfModule>
Listen 80
"#;
        let root = parse_source(source).unwrap();
        assert_eq!(root.all_directives("Listen").len(), 1);
        assert_eq!(root.directive("Listen"), Some("80"));
        assert!(root.children_of(&["VirtualHost"]).is_empty());
    }

    #[test]
    fn repeated_directives_keep_every_occurrence() {
        let source = "AddType text/html html htm\nAddType image/png png\n";
        let root = parse_source(source).unwrap();
        let all = root.all_directives("AddType");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1], &["image/png".to_string(), "png".to_string()]);
    }

    #[test]
    fn include_glob_expansion_merges_vhosts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("vhosts.d")).unwrap();
        fs::write(
            dir.path().join("httpd.conf"),
            "Listen 80\nIncludeOptional vhosts.d/*.conf\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("vhosts.d/a.conf"),
            "<VirtualHost *:80>\nServerName a.test\n</VirtualHost>\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("vhosts.d/b.conf"),
            "<VirtualHost *:80>\nServerName b.test\n</VirtualHost>\n",
        )
        .unwrap();
        fs::write(dir.path().join("vhosts.d/ignored.txt"), "not config").unwrap();

        let root = parse_tree(&dir.path().join("httpd.conf")).unwrap();
        let vhosts = root.children_of(&["VirtualHost"]);
        assert_eq!(vhosts.len(), 2);
        assert_eq!(vhosts[0].directive("ServerName"), Some("a.test"));
        assert_eq!(vhosts[1].directive("ServerName"), Some("b.test"));
    }

    #[test]
    fn missing_include_is_an_error_but_optional_is_not() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("strict.conf"), "Include missing.conf\n").unwrap();
        fs::write(
            dir.path().join("lenient.conf"),
            "IncludeOptional missing.conf\nListen 80\n",
        )
        .unwrap();

        assert!(parse_tree(&dir.path().join("strict.conf")).is_err());
        let root = parse_tree(&dir.path().join("lenient.conf")).unwrap();
        assert_eq!(root.directive("Listen"), Some("80"));
    }

    #[test]
    fn circular_includes_are_visited_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.conf"),
            "Listen 80\nInclude b.conf\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.conf"),
            "Listen 443\nInclude a.conf\n",
        )
        .unwrap();

        let root = parse_tree(&dir.path().join("a.conf")).unwrap();
        let listens: Vec<_> = root.all_directives("Listen");
        assert_eq!(listens.len(), 2);
    }

    #[test]
    fn glob_translation_is_anchored_and_escaped() {
        let re = glob_to_regex("*.conf").unwrap();
        assert!(re.is_match("site.conf"));
        assert!(!re.is_match("site.conf.bak"));
        assert!(!re.is_match("siteXconf"));

        let re = glob_to_regex("site-?.conf").unwrap();
        assert!(re.is_match("site-1.conf"));
        assert!(!re.is_match("site-10.conf"));
    }
}
