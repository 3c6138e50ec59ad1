//! Two-pass Puppetfile parser.
//!
//! 1.  **Preprocessing** ([`preprocess`]): comments and blank lines are
//!     dropped and physical lines ending in a trailing comma are joined with
//!     their continuation into one logical line.
//! 2.  **Classification**: every logical line is tokenized and classified as
//!     a directive, a Forge declaration, a Git declaration or an unknown
//!     line. A declaration written in Forge notation that carries a `:git`
//!     or `:local` attribute is classified as Git here, so the extraction
//!     pass never has to reclassify anything.
//! 3.  **Extraction**: each declaration is turned into a typed spec and the
//!     manifest-level invariants (no duplicate names, no conflicting
//!     attributes) are checked.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::{
    ForgeModuleSpec, ForgeVersion, GitModuleSpec, GitReference, ModuleManifest, ParseOptions,
    DEFAULT_MODULE_DIR,
};
use crate::duration::parse_duration;
use crate::error::{Error, Result};

/// Attributes of which at most one may select the tree of a Git module.
const TREE_SELECTORS: &[&str] = &["commit", "tag", "branch", "ref", "link"];

/// Boolean and list attributes that do not count towards the attribute cap.
const FLAG_ATTRIBUTES: &[&str] = &["ignore_unreachable", "use_ssh_agent", "fallback"];

/// Maximum number of non-flag attributes on a Git declaration.
const MAX_GIT_ATTRIBUTES: usize = 4;

/// One logical manifest line with the 1-based number of its first physical
/// line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Symbol(String),
    Bare(String),
}

impl Value {
    fn text(&self) -> &str {
        match self {
            Value::Str(s) | Value::Symbol(s) | Value::Bare(s) => s,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self.text() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Argument {
    Positional(Value),
    Attribute { key: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeclarationKind {
    ModuleDir(String),
    ForgeBaseUrl(String),
    ForgeCacheTtl(String),
    Forge { name: String, args: Vec<Argument> },
    Git { name: String, args: Vec<Argument> },
    Unknown,
}

#[derive(Debug, Clone)]
struct Declaration {
    line: usize,
    text: String,
    kind: DeclarationKind,
}

/// Read and parse the manifest at `path`.
pub fn parse_file(path: &Path, options: &ParseOptions) -> Result<ModuleManifest> {
    let content = fs::read_to_string(path).map_err(|e| Error::filesystem(path, e))?;
    parse_str(&content, path, options)
}

/// Parse manifest `content`; `path` is only used for diagnostics.
pub fn parse_str(content: &str, path: &Path, options: &ParseOptions) -> Result<ModuleManifest> {
    let display = path.display().to_string();
    let lines = preprocess(content, &display)?;

    let declarations = lines
        .iter()
        .map(|line| classify(line, &display))
        .collect::<Result<Vec<_>>>()?;

    let mut builder = ManifestBuilder::new(path, &display, options);
    for declaration in declarations {
        builder.apply(declaration)?;
    }
    let manifest = builder.finish();

    debug!(
        "Parsed {}: {} Forge and {} Git modules",
        display,
        manifest.forge_modules.len(),
        manifest.git_modules.len()
    );
    Ok(manifest)
}

/// Strip comments and blank lines and join trailing-comma continuations.
///
/// A logical line that still ends in a comma at the end of the input, or
/// whose continuation starts a new declaration, is a dangling attribute.
pub fn preprocess(content: &str, path: &str) -> Result<Vec<LogicalLine>> {
    let mut lines = Vec::new();
    let mut pending: Option<LogicalLine> = None;

    for (idx, raw) in content.lines().enumerate() {
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }

        match pending.as_mut() {
            Some(open) => {
                if starts_declaration(text) {
                    return Err(dangling(path, open));
                }
                open.text.push(' ');
                open.text.push_str(text);
            }
            None => {
                pending = Some(LogicalLine {
                    line: idx + 1,
                    text: text.to_string(),
                })
            }
        }

        if !text.ends_with(',') {
            if let Some(done) = pending.take() {
                lines.push(done);
            }
        }
    }

    if let Some(open) = pending {
        return Err(dangling(path, &open));
    }
    Ok(lines)
}

fn dangling(path: &str, line: &LogicalLine) -> Error {
    Error::manifest(
        path,
        line.line,
        format!(
            "dangling attribute: '{}' ends with a trailing comma but no attribute follows",
            line.text
        ),
    )
}

fn starts_declaration(text: &str) -> bool {
    text.starts_with("mod ")
        || text.starts_with("mod(")
        || text.starts_with("moduledir")
        || text.starts_with("forge")
}

fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match quote {
            None if c == '#' => return &line[..i],
            None if c == '\'' || c == '"' => quote = Some(c),
            Some(q) if c == q => quote = None,
            _ => {}
        }
    }
    line
}

/// Split on commas that are not inside quotes.
fn split_args(text: &str) -> std::result::Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == ',' => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            None => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(format!("unterminated string in '{}'", text));
    }
    parts.push(current.trim().to_string());

    if parts.iter().any(|p| p.is_empty()) {
        return Err(format!("empty argument in '{}'", text));
    }
    Ok(parts)
}

fn parse_value(raw: &str) -> std::result::Result<Value, String> {
    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')))
    {
        return Ok(Value::Str(raw[1..raw.len() - 1].to_string()));
    }
    if let Some(symbol) = raw.strip_prefix(':') {
        if symbol.is_empty() {
            return Err("empty symbol".to_string());
        }
        return Ok(Value::Symbol(symbol.to_string()));
    }
    if raw.is_empty() || raw.contains(char::is_whitespace) {
        return Err(format!("cannot interpret value '{}'", raw));
    }
    Ok(Value::Bare(raw.to_string()))
}

fn normalize_key(key: &str) -> String {
    match key {
        "ignore-unreachable" => "ignore_unreachable".to_string(),
        "default_branch" => "fallback".to_string(),
        other => other.to_string(),
    }
}

fn parse_argument(token: &str) -> std::result::Result<Argument, String> {
    let first_quote = token.find(['\'', '"']).unwrap_or(token.len());

    // Hash-rocket form: `:key => value`
    if let Some(arrow) = token.find("=>").filter(|&pos| pos < first_quote) {
        let key = token[..arrow].trim();
        let key = key
            .strip_prefix(':')
            .ok_or_else(|| format!("attribute key '{}' must be a symbol", key))?;
        let value = parse_value(&token[arrow + 2..])?;
        return Ok(Argument::Attribute {
            key: normalize_key(key),
            value,
        });
    }

    // Keyword form: `key: value`
    if let Some(colon) = token.find(": ").filter(|&pos| pos < first_quote) {
        let key = token[..colon].trim();
        if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            let value = parse_value(&token[colon + 1..])?;
            return Ok(Argument::Attribute {
                key: normalize_key(key),
                value,
            });
        }
    }

    Ok(Argument::Positional(parse_value(token)?))
}

fn directive_value(text: &str, keyword: &str) -> Option<String> {
    let rest = text.strip_prefix(keyword)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let value = rest.trim();
    let value = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .unwrap_or(value);
    Some(value.to_string())
}

/// First pass: decide what kind of declaration a logical line is.
fn classify(line: &LogicalLine, path: &str) -> Result<Declaration> {
    let text = line.text.as_str();
    let fail = |message: String| Error::manifest(path, line.line, message);

    if text.starts_with(':') {
        return Err(fail(format!(
            "attribute '{}' does not belong to any module (missing trailing comma on the previous line?)",
            text
        )));
    }

    let kind = if let Some(dir) = directive_value(text, "moduledir") {
        DeclarationKind::ModuleDir(dir)
    } else if let Some(url) = directive_value(text, "forge.baseUrl") {
        DeclarationKind::ForgeBaseUrl(url)
    } else if let Some(ttl) = directive_value(text, "forge.cacheTtl") {
        DeclarationKind::ForgeCacheTtl(ttl)
    } else if let Some(url) = directive_value(text, "forge") {
        DeclarationKind::ForgeBaseUrl(url)
    } else if let Some(rest) = text.strip_prefix("mod") {
        if !rest.starts_with([' ', '(']) {
            DeclarationKind::Unknown
        } else {
            let rest = rest.trim();
            let rest = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .unwrap_or(rest);
            let mut tokens = split_args(rest).map_err(&fail)?.into_iter();
            let name = match tokens.next().map(|t| parse_value(&t)) {
                Some(Ok(Value::Str(name))) if !name.is_empty() => name,
                _ => return Err(fail(format!("module name must be a quoted string in '{}'", text))),
            };
            let args = tokens
                .map(|t| parse_argument(&t))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(&fail)?;

            let mut seen = HashSet::new();
            for arg in &args {
                if let Argument::Attribute { key, .. } = arg {
                    if !seen.insert(key.clone()) {
                        return Err(fail(format!(
                            "attribute ':{}' given more than once for module '{}'",
                            key, name
                        )));
                    }
                }
            }

            let is_git = seen.contains("git") || seen.contains("local");
            if is_git {
                DeclarationKind::Git { name, args }
            } else {
                DeclarationKind::Forge { name, args }
            }
        }
    } else {
        DeclarationKind::Unknown
    };

    Ok(Declaration {
        line: line.line,
        text: text.to_string(),
        kind,
    })
}

/// Second pass: accumulates typed specs into a manifest.
struct ManifestBuilder<'a> {
    path: &'a str,
    options: &'a ParseOptions,
    manifest: ModuleManifest,
    module_dir: String,
}

impl<'a> ManifestBuilder<'a> {
    fn new(path: &Path, display: &'a str, options: &'a ParseOptions) -> Self {
        let module_dir = options
            .module_dir_override
            .clone()
            .unwrap_or_else(|| DEFAULT_MODULE_DIR.to_string());
        Self {
            path: display,
            options,
            manifest: ModuleManifest {
                path: path.to_path_buf(),
                source: options.source.clone(),
                branch: options.branch.clone(),
                private_key: options.private_key.clone(),
                ..Default::default()
            },
            module_dir,
        }
    }

    fn fail(&self, line: usize, message: impl Into<String>) -> Error {
        Error::manifest(self.path, line, message)
    }

    fn origin(&self) -> String {
        format!("{}/{}", self.options.source, self.options.branch)
    }

    fn apply(&mut self, declaration: Declaration) -> Result<()> {
        let line = declaration.line;
        match declaration.kind {
            DeclarationKind::ModuleDir(dir) => {
                if self.options.module_dir_override.is_some() {
                    debug!("{}:{}: moduledir ignored, override active", self.path, line);
                } else {
                    self.module_dir = dir.trim_end_matches('/').to_string();
                }
            }
            DeclarationKind::ForgeBaseUrl(url) => {
                self.manifest.forge_base_url = Some(url.trim_end_matches('/').to_string());
            }
            DeclarationKind::ForgeCacheTtl(ttl) => {
                let ttl = parse_duration(&ttl)
                    .map_err(|e| self.fail(line, format!("invalid forge.cacheTtl: {}", e)))?;
                self.manifest.forge_cache_ttl = Some(ttl);
            }
            DeclarationKind::Forge { name, args } => self.add_forge(line, &name, args)?,
            DeclarationKind::Git { name, args } => self.add_git(line, &name, args)?,
            DeclarationKind::Unknown => {
                if self.options.strict {
                    return Err(self.fail(
                        line,
                        format!("could not interpret line: {}", declaration.text),
                    ));
                }
                warn!(
                    "{}:{}: ignoring unrecognized line: {}",
                    self.path, line, declaration.text
                );
            }
        }
        Ok(())
    }

    fn ensure_unique(&self, line: usize, name: &str) -> Result<()> {
        if self.manifest.forge_modules.contains_key(name) {
            return Err(self.fail(line, format!("duplicate module name '{}'", name)));
        }
        if self.manifest.git_modules.contains_key(name) {
            return Err(self.fail(
                line,
                format!("module '{}' is already declared as a Git module", name),
            ));
        }
        Ok(())
    }

    fn add_forge(&mut self, line: usize, full_name: &str, args: Vec<Argument>) -> Result<()> {
        let (author, name) = full_name
            .split_once('/')
            .or_else(|| full_name.split_once('-'))
            .filter(|(a, n)| !a.is_empty() && !n.is_empty() && !n.contains('/'))
            .ok_or_else(|| self.fail(line, format!("invalid Forge module name '{}'", full_name)))?;

        let mut version: Option<ForgeVersion> = None;
        let mut sha256sum = None;
        for arg in args {
            match arg {
                Argument::Positional(value) => {
                    if version.is_some() {
                        return Err(self.fail(
                            line,
                            format!("more than one version given for '{}'", full_name),
                        ));
                    }
                    version = Some(ForgeVersion::parse(value.text()));
                }
                Argument::Attribute { key, value } if key == "sha256sum" => {
                    sha256sum = Some(value.text().to_lowercase());
                }
                Argument::Attribute { key, .. } => {
                    return Err(self.fail(
                        line,
                        format!("unknown attribute ':{}' for Forge module '{}'", key, full_name),
                    ));
                }
            }
        }
        let version = version.unwrap_or(ForgeVersion::Present);

        if self.options.force_forge_versions && version.is_sentinel() {
            return Err(self.fail(
                line,
                format!(
                    "Forge module '{}' must declare an explicit version, found '{}'",
                    full_name, version
                ),
            ));
        }

        self.ensure_unique(line, name)?;
        self.manifest.forge_modules.insert(
            name.to_string(),
            ForgeModuleSpec {
                author: author.to_string(),
                name: name.to_string(),
                version,
                base_url: None,
                cache_ttl: None,
                sha256sum,
                module_dir: self.module_dir.clone(),
                origin: self.origin(),
            },
        );
        self.note_module_dir();
        Ok(())
    }

    fn add_git(&mut self, line: usize, full_name: &str, args: Vec<Argument>) -> Result<()> {
        // Forge notation (`author/name`) carrying a Git remote
        let name = full_name.rsplit('/').next().unwrap_or(full_name);
        if name.is_empty() {
            return Err(self.fail(line, format!("invalid module name '{}'", full_name)));
        }

        let mut attributes = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Argument::Attribute { key, value } => attributes.push((key, value)),
                Argument::Positional(value) => {
                    return Err(self.fail(
                        line,
                        format!(
                            "unexpected argument '{}' for Git module '{}'",
                            value.text(),
                            name
                        ),
                    ));
                }
            }
        }

        let selectors: Vec<&str> = attributes
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(|k| TREE_SELECTORS.contains(k))
            .collect();
        if selectors.len() > 1 {
            return Err(self.fail(
                line,
                format!(
                    "conflicting attributes for module '{}': only one of :commit, :tag, :branch, :ref, :link may be given (found :{})",
                    name,
                    selectors.join(", :")
                ),
            ));
        }
        let counted = attributes
            .iter()
            .filter(|(k, _)| !FLAG_ATTRIBUTES.contains(&k.as_str()))
            .count();
        if counted > MAX_GIT_ATTRIBUTES {
            return Err(self.fail(
                line,
                format!("too many attributes for Git module '{}'", name),
            ));
        }

        let mut spec = GitModuleSpec {
            module_dir: self.module_dir.clone(),
            ..Default::default()
        };
        for (key, value) in attributes {
            match key.as_str() {
                "git" => spec.git = Some(value.text().to_string()),
                "local" => spec.local = self.bool_attr(line, &key, &value)?,
                "branch" => {
                    spec.reference = if value.text() == "control_branch" {
                        GitReference::Link
                    } else {
                        GitReference::Branch(value.text().to_string())
                    }
                }
                "tag" => spec.reference = GitReference::Tag(value.text().to_string()),
                "commit" => spec.reference = GitReference::Commit(value.text().to_string()),
                "ref" => spec.reference = GitReference::Ref(value.text().to_string()),
                "link" => {
                    if self.bool_attr(line, &key, &value)? {
                        spec.reference = GitReference::Link;
                    }
                }
                "ignore_unreachable" => {
                    spec.ignore_unreachable = self.bool_attr(line, &key, &value)?
                }
                "use_ssh_agent" => spec.use_ssh_agent = self.bool_attr(line, &key, &value)?,
                "fallback" => {
                    spec.fallback = value
                        .text()
                        .split('|')
                        .map(str::trim)
                        .filter(|b| !b.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "install_path" => {
                    spec.install_path = Some(value.text().trim_end_matches('/').to_string())
                }
                "private_key" => spec.private_key = Some(PathBuf::from(value.text())),
                other => {
                    return Err(self.fail(
                        line,
                        format!("unknown attribute ':{}' for Git module '{}'", other, name),
                    ));
                }
            }
        }

        if spec.git.is_none() && !spec.local {
            return Err(self.fail(
                line,
                format!("Git module '{}' needs :git or :local => true", name),
            ));
        }

        self.ensure_unique(line, name)?;
        self.manifest.git_modules.insert(name.to_string(), spec);
        self.note_module_dir();
        Ok(())
    }

    fn bool_attr(&self, line: usize, key: &str, value: &Value) -> Result<bool> {
        value.as_bool().ok_or_else(|| {
            self.fail(
                line,
                format!(
                    "attribute ':{}' expects true or false, got '{}'",
                    key,
                    value.text()
                ),
            )
        })
    }

    fn note_module_dir(&mut self) {
        if !self.manifest.module_dirs.contains(&self.module_dir) {
            self.manifest.module_dirs.push(self.module_dir.clone());
        }
    }

    fn finish(mut self) -> ModuleManifest {
        self.note_module_dir();
        self.manifest
    }
}
