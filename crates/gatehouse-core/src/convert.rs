//! Lowering of the parsed Apache tree to the native configuration model.

use std::path::Path;

use regex::Regex;

use crate::apache::{parse_tree, ConfigNode};
use crate::config::{Config, Location, LogEntry, MatchRule, MimeType, VirtualHost};
use crate::error::GatewayResult;

/// Parse an Apache configuration file and lower it onto `base`. All location
/// patterns are compiled before the config is returned, so a convert-then-
/// load round trip can never produce an uncompilable file.
pub fn convert_file(path: &Path, base: Config) -> GatewayResult<Config> {
    let tree = parse_tree(path)?;
    convert_tree(&tree, base)
}

pub fn convert_tree(root: &ConfigNode, base: Config) -> GatewayResult<Config> {
    let mut config = base;

    if let Some(user) = root.directive("User") {
        config.user = user.to_string();
    }
    if let Some(group) = root.directive("Group") {
        config.group = group.to_string();
    }
    if let Some(admin) = root.directive("ServerAdmin") {
        config.server_admin = admin.to_string();
    }
    if let Some(args) = root.directive_args("DirectoryIndex") {
        config.directory_index = args.join(" ");
    }
    for args in root.all_directives("Listen") {
        for arg in args {
            if let Some(port) = extract_port(arg) {
                if !config.listen.contains(&port) {
                    config.listen.push(port);
                }
            }
        }
    }

    for args in root.all_directives("AddType") {
        let Some((mime, exts)) = args.split_first() else {
            continue;
        };
        for ext in exts {
            let ext = ext.trim_start_matches('.').to_string();
            if !config.mime_types.iter().any(|mt| mt.ext == ext) {
                config.mime_types.push(MimeType {
                    ext,
                    mime: mime.clone(),
                });
            }
        }
    }

    for args in root.all_directives("Action") {
        if let Some(kind) = args.first() {
            if kind.contains("php") {
                tracing::debug!(target: "gatehouse::convert", action = %args.join(" "), "php handler hint recorded");
            }
        }
    }

    for vhost_node in root.children_of(&["VirtualHost"]) {
        config.virtual_hosts.push(convert_virtual_host(vhost_node));
    }

    config.compile_all_patterns()?;
    Ok(config)
}

fn convert_virtual_host(node: &ConfigNode) -> VirtualHost {
    let mut vhost = VirtualHost::default();

    if let Some(addr) = node.arguments.first() {
        if let Some(port) = extract_port(addr) {
            vhost.listen = vec![port];
        }
    }

    vhost.server_name = node.directive("ServerName").unwrap_or_default().to_string();
    for args in node.all_directives("ServerAlias") {
        for alias in args {
            vhost.server_alias.push(alias.clone());
        }
    }
    vhost.document_root = node
        .directive("DocumentRoot")
        .unwrap_or_default()
        .trim_matches('"')
        .to_string();
    vhost.server_admin = node.directive("ServerAdmin").unwrap_or_default().to_string();
    if let Some(args) = node.directive_args("DirectoryIndex") {
        vhost.directory_index = args.join(" ");
    }
    for args in node.all_directives("ErrorLog") {
        if let Some(path) = args.first() {
            vhost.error_log.push(LogEntry {
                path: path.clone(),
                format: String::new(),
            });
        }
    }
    for args in node.all_directives("CustomLog") {
        if let Some(path) = args.first() {
            vhost.custom_log.push(LogEntry {
                path: path.clone(),
                format: args.get(1).cloned().unwrap_or_default(),
            });
        }
    }

    apply_identity(node, &mut vhost);

    // Vhost-level ProxyPass lowers to a prefix location of its own.
    for args in node.all_directives("ProxyPass") {
        if args.len() >= 2 {
            let (socket, proxy_type) = parse_proxy_target(&args[1]);
            vhost.locations.push(Location {
                path: args[0].clone(),
                handler: "proxy".to_string(),
                proxy_unix_socket: socket,
                proxy_type,
                ..Location::default()
            });
        }
    }

    for child in &node.children {
        match child.kind.to_ascii_lowercase().as_str() {
            "directory" | "directorymatch" | "location" | "locationmatch" | "files"
            | "filesmatch" => {
                vhost.locations.push(convert_block(child));
            }
            _ => {}
        }
    }

    if vhost.server_name.is_empty() {
        vhost.server_name = if vhost.document_root.is_empty() {
            "_default_".to_string()
        } else {
            Path::new(&vhost.document_root)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "_default_".to_string())
        };
    }

    vhost
}

/// User/group from the identity directives. Combined forms carry both halves
/// in one directive instance.
fn apply_identity(node: &ConfigNode, vhost: &mut VirtualHost) {
    vhost.user = node.directive("User").unwrap_or_default().to_string();
    vhost.group = node.directive("Group").unwrap_or_default().to_string();

    for combined in ["SuexecUserGroup", "AssignUserID", "suPHP_UserGroup"] {
        if !vhost.user.is_empty() && !vhost.group.is_empty() {
            break;
        }
        if let Some(args) = node.directive_args(combined) {
            if vhost.user.is_empty() {
                if let Some(user) = args.first() {
                    vhost.user = user.clone();
                }
            }
            if vhost.group.is_empty() {
                if let Some(group) = args.get(1) {
                    vhost.group = group.clone();
                }
            }
        }
    }
    if vhost.user.is_empty() {
        vhost.user = node
            .directive("PassengerUser")
            .unwrap_or_default()
            .to_string();
    }
    if vhost.group.is_empty() {
        vhost.group = node
            .directive("PassengerGroup")
            .unwrap_or_default()
            .to_string();
    }
}

/// Lower a `<Directory>`/`<Location>`-family block to a location. Nested
/// `<FilesMatch>`/`<Files>` blocks become match rules on the location.
fn convert_block(node: &ConfigNode) -> Location {
    let mut location = Location {
        path: node
            .arguments
            .first()
            .map(|arg| arg.trim_matches(|c| c == '"' || c == '\'').to_string())
            .unwrap_or_default(),
        handler: "static".to_string(),
        ..Location::default()
    };

    location.match_type = match node.kind.to_ascii_lowercase().as_str() {
        "directorymatch" | "locationmatch" | "files" => "regex".to_string(),
        "filesmatch" => "regexCaseInsensitive".to_string(),
        _ => "prefix".to_string(),
    };

    apply_block_directives(node, BlockTarget::Location(&mut location));

    for rule_node in node.children_of(&["FilesMatch", "Files"]) {
        let mut rule = MatchRule {
            pattern: rule_node
                .arguments
                .first()
                .map(|arg| arg.trim_matches(|c| c == '"' || c == '\'').to_string())
                .unwrap_or_default(),
            ..MatchRule::default()
        };
        apply_block_directives(rule_node, BlockTarget::Rule(&mut rule));
        location.match_rules.push(rule);
    }

    location
}

/// The directive set shared by locations and match rules.
enum BlockTarget<'a> {
    Location(&'a mut Location),
    Rule(&'a mut MatchRule),
}

impl BlockTarget<'_> {
    fn set_handler(&mut self, handler: &str) {
        match self {
            BlockTarget::Location(loc) => loc.handler = handler.to_string(),
            BlockTarget::Rule(rule) => rule.handler = handler.to_string(),
        }
    }

    fn set_proxy(&mut self, socket: String, proxy_type: String) {
        match self {
            BlockTarget::Location(loc) => {
                loc.proxy_unix_socket = socket;
                loc.proxy_type = proxy_type;
            }
            BlockTarget::Rule(rule) => {
                rule.proxy_unix_socket = socket;
                rule.proxy_type = proxy_type;
            }
        }
    }

    fn set_cgi_path(&mut self, path: String) {
        match self {
            BlockTarget::Location(loc) => loc.cgi_path = path,
            BlockTarget::Rule(rule) => rule.cgi_path = path,
        }
    }

    fn set_directory_index(&mut self, index: String) {
        match self {
            BlockTarget::Location(loc) => loc.directory_index = index,
            BlockTarget::Rule(rule) => rule.directory_index = index,
        }
    }

    fn set_match_type(&mut self, match_type: &str) {
        if let BlockTarget::Location(loc) = self {
            loc.match_type = match_type.to_string();
        }
    }
}

fn apply_block_directives(node: &ConfigNode, mut target: BlockTarget<'_>) {
    if let Some(args) = node.directive_args("DirectoryIndex") {
        target.set_directory_index(args.join(" "));
    }

    if let Some(args) = node.directive_args("ProxyPass") {
        let proxy_target = if args.len() >= 2 { &args[1] } else { &args[0] };
        let (socket, proxy_type) = parse_proxy_target(proxy_target);
        target.set_handler("proxy");
        target.set_proxy(socket, proxy_type);
    }
    if let Some(args) = node.directive_args("ProxyPassMatch") {
        let proxy_target = if args.len() >= 2 { &args[1] } else { &args[0] };
        let (socket, proxy_type) = parse_proxy_target(proxy_target);
        target.set_handler("proxy");
        target.set_proxy(socket, proxy_type);
        target.set_match_type("regex");
    }

    for directive in ["ScriptAlias", "ScriptAliasMatch"] {
        if let Some(args) = node.directive_args(directive) {
            if let Some(src) = args.first() {
                target.set_handler("cgi");
                target.set_cgi_path(src.clone());
                if directive == "ScriptAliasMatch" {
                    target.set_match_type("regex");
                }
            }
        }
    }

    if let Some(handler) = node.directive("SetHandler") {
        apply_set_handler(handler, &mut target);
    }

    if node.directive("php_admin_value").is_some() || node.directive("php_flag").is_some() {
        target.set_handler("php");
    }
}

/// `SetHandler` forms:
///   proxy:unix:/run/php.sock|fcgi://localhost/  -> proxy over unix, fcgi
///   proxy:fcgi / fcgid-script                   -> proxy, fcgi
///   proxy / proxy-server                        -> proxy, http
///   cgi-script                                  -> cgi
///   anything containing "php"                   -> php
fn apply_set_handler(raw: &str, target: &mut BlockTarget<'_>) {
    let handler = raw.trim_matches(|c| c == '"' || c == '\'');
    let lowered = handler.to_ascii_lowercase();

    if lowered.starts_with("proxy:unix:") {
        let rest = &handler["proxy:unix:".len()..];
        let (socket, scheme) = match rest.split_once('|') {
            Some((socket, scheme)) => (socket, scheme),
            None => (rest, ""),
        };
        let proxy_type = if scheme.to_ascii_lowercase().contains("fcgi") {
            "fcgi"
        } else {
            "http"
        };
        target.set_handler("proxy");
        target.set_proxy(socket.to_string(), proxy_type.to_string());
        return;
    }

    match lowered.as_str() {
        "proxy:fcgi" | "fcgid-script" => {
            target.set_handler("proxy");
            target.set_proxy(String::new(), "fcgi".to_string());
        }
        "proxy" | "proxy-server" => {
            target.set_handler("proxy");
            target.set_proxy(String::new(), "http".to_string());
        }
        "cgi-script" => target.set_handler("cgi"),
        _ if lowered.contains("php") => target.set_handler("php"),
        _ => {}
    }
}

/// Proxy targets may carry `unix:` / `fcgi://` prefixes; strip them to the
/// socket path and derive the proxy type.
fn parse_proxy_target(target: &str) -> (String, String) {
    if let Some(rest) = target.strip_prefix("unix:") {
        return match rest.split_once('|') {
            Some((socket, scheme)) if scheme.to_ascii_lowercase().contains("fcgi") => {
                (socket.to_string(), "fcgi".to_string())
            }
            Some((socket, _)) => (socket.to_string(), "http".to_string()),
            None => (rest.to_string(), "http".to_string()),
        };
    }
    if let Some(rest) = target.strip_prefix("fcgi://") {
        return (rest.to_string(), "fcgi".to_string());
    }
    (target.to_string(), "http".to_string())
}

fn extract_port(arg: &str) -> Option<String> {
    let port_re = Regex::new(r":(\d+)$").ok()?;
    if let Some(captures) = port_re.captures(arg) {
        return Some(captures[1].to_string());
    }
    if !arg.is_empty() && arg.chars().all(|c| c.is_ascii_digit()) {
        return Some(arg.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apache::parse_source;

    fn convert(source: &str) -> Config {
        let tree = parse_source(source).unwrap();
        convert_tree(&tree, Config::default()).unwrap()
    }

    #[test]
    fn minimal_virtual_host_conversion() {
        let config = convert(
            "<VirtualHost *:80>\nServerName ex.com\nDocumentRoot /var/www/ex\n</VirtualHost>\n",
        );
        assert_eq!(config.virtual_hosts.len(), 1);
        let vhost = &config.virtual_hosts[0];
        assert_eq!(vhost.server_name, "ex.com");
        assert_eq!(vhost.document_root, "/var/www/ex");
        assert_eq!(vhost.listen, vec!["80"]);
        assert_eq!(config.all_listen_ports(), vec!["80"]);
    }

    #[test]
    fn files_match_inside_directory_becomes_match_rule() {
        let config = convert(
            r#"<VirtualHost *:80>
ServerName wp.test
DocumentRoot /var/www
<Directory /var/www>
    <FilesMatch "\.php$">
        SetHandler "proxy:unix:/run/php.sock|fcgi://localhost/"
    </FilesMatch>
</Directory>
</VirtualHost>
"#,
        );
        let vhost = &config.virtual_hosts[0];
        assert_eq!(vhost.locations.len(), 1);
        let location = &vhost.locations[0];
        assert_eq!(location.path, "/var/www");
        assert_eq!(location.match_rules.len(), 1);
        let rule = &location.match_rules[0];
        assert_eq!(rule.handler, "proxy");
        assert_eq!(rule.proxy_type, "fcgi");
        assert_eq!(rule.proxy_unix_socket, "/run/php.sock");
        assert!(rule.matches("index.php"));
        assert!(!rule.matches("index.html"));
    }

    #[test]
    fn identity_directives_fill_user_and_group_from_one_instance() {
        let config = convert(
            "<VirtualHost *:80>\nServerName s.test\nSuexecUserGroup alice web\n</VirtualHost>\n",
        );
        let vhost = &config.virtual_hosts[0];
        assert_eq!(vhost.user, "alice");
        assert_eq!(vhost.group, "web");

        let config = convert(
            "<VirtualHost *:80>\nServerName p.test\nPassengerUser bob\nPassengerGroup app\n</VirtualHost>\n",
        );
        let vhost = &config.virtual_hosts[0];
        assert_eq!(vhost.user, "bob");
        assert_eq!(vhost.group, "app");
    }

    #[test]
    fn suphp_user_group_reads_both_halves() {
        let config = convert(
            "<VirtualHost *:80>\nServerName s.test\nsuPHP_UserGroup carol staff\n</VirtualHost>\n",
        );
        let vhost = &config.virtual_hosts[0];
        assert_eq!(vhost.user, "carol");
        assert_eq!(vhost.group, "staff");
    }

    #[test]
    fn script_alias_lowers_to_cgi_location() {
        let config = convert(
            r#"<VirtualHost *:80>
ServerName cgi.test
<Location /cgi-bin>
    ScriptAlias /cgi-bin /usr/lib/cgi-bin
</Location>
</VirtualHost>
"#,
        );
        let location = &config.virtual_hosts[0].locations[0];
        assert_eq!(location.handler, "cgi");
        assert_eq!(location.cgi_path, "/cgi-bin");
    }

    #[test]
    fn set_handler_variants() {
        let config = convert(
            r#"<VirtualHost *:80>
ServerName h.test
<Location /a>
    SetHandler cgi-script
</Location>
<Location /b>
    SetHandler proxy:fcgi
</Location>
<Location /c>
    SetHandler application/x-httpd-php
</Location>
</VirtualHost>
"#,
        );
        let locations = &config.virtual_hosts[0].locations;
        assert_eq!(locations[0].handler, "cgi");
        assert_eq!(locations[1].handler, "proxy");
        assert_eq!(locations[1].proxy_type, "fcgi");
        assert_eq!(locations[2].handler, "php");
    }

    #[test]
    fn proxy_pass_strips_unix_and_fcgi_prefixes() {
        let config = convert(
            r#"<VirtualHost *:80>
ServerName app.test
ProxyPass /api unix:/run/app.sock|http://localhost/
</VirtualHost>
"#,
        );
        let location = &config.virtual_hosts[0].locations[0];
        assert_eq!(location.path, "/api");
        assert_eq!(location.handler, "proxy");
        assert_eq!(location.proxy_unix_socket, "/run/app.sock");
        assert_eq!(location.proxy_type, "http");

        assert_eq!(
            parse_proxy_target("fcgi://127.0.0.1:9000"),
            ("127.0.0.1:9000".to_string(), "fcgi".to_string())
        );
    }

    #[test]
    fn directory_match_gets_regex_match_type() {
        let config = convert(
            r#"<VirtualHost *:80>
ServerName rx.test
<DirectoryMatch "^/srv/site[0-9]+">
</DirectoryMatch>
</VirtualHost>
"#,
        );
        let location = &config.virtual_hosts[0].locations[0];
        assert_eq!(location.match_type, "regex");
    }

    #[test]
    fn server_name_derived_from_document_root() {
        let config = convert(
            "<VirtualHost *:80>\nDocumentRoot /home/site42/public_html\n</VirtualHost>\n",
        );
        assert_eq!(config.virtual_hosts[0].server_name, "public_html");

        let config = convert("<VirtualHost *:80>\n</VirtualHost>\n");
        assert_eq!(config.virtual_hosts[0].server_name, "_default_");
    }

    #[test]
    fn global_directives_and_mime_types() {
        let config = convert(
            "User apache\nGroup apache\nListen 80\nListen 0.0.0.0:8080\nDirectoryIndex index.html index.php\nAddType image/webp webp\nAddType image/webp .webp\n",
        );
        assert_eq!(config.user, "apache");
        assert_eq!(config.listen, vec!["80", "8080"]);
        assert_eq!(config.directory_index, "index.html index.php");
        assert_eq!(config.mime_types.len(), 1);
        assert_eq!(config.mime_lookup("webp"), Some("image/webp"));
    }

    #[test]
    fn convert_then_load_round_trips() {
        let config = convert(
            r#"<VirtualHost *:80>
ServerName rt.test
DocumentRoot /var/www/rt
<Directory /var/www/rt>
    <FilesMatch "\.php$">
        SetHandler "proxy:unix:/run/php.sock|fcgi://localhost/"
    </FilesMatch>
</Directory>
</VirtualHost>
"#,
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converted.json");
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.virtual_hosts.len(), 1);
        let rule = &loaded.virtual_hosts[0].locations[0].match_rules[0];
        assert!(rule.matches("page.php"));
        assert_eq!(
            loaded.all_listen_ports(),
            config.all_listen_ports()
        );
    }
}
