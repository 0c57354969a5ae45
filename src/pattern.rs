//! File-path pattern engine.
//!
//! A ruleset is an ordered list of rules scanned linearly; the first
//! non-skipped matching rule decides. Rules come in three shapes:
//! `+pattern` (include), `-pattern` (exclude), and `N+pattern`/`N-pattern`
//! which skip the next N rules when their pattern matches. The bare tokens
//! `+`, `+*`, `+**` and `-`, `-*`, `-**` shortcut the whole set at setup
//! time. Two negation sources (user and the `:negate` macro) are XORed into
//! the active polarity.

use crate::error::{WdError, WdResult};

/// Glob match of `pat` against `text`.
///
/// `*` and `?` do not cross path separators, `**` does. A pattern starting
/// with the separator is anchored at the text start, otherwise it may match
/// at any component boundary. A trailing separator makes the pattern a
/// directory prefix (it matches everything beneath); a trailing `$` anchors
/// the end of the text.
pub fn match_pattern(pattern: &str, text: &str, sep: char) -> bool {
    let sep = sep as u8;
    let (pat, anchored_end) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };
    let pat = pat.as_bytes();
    let text = text.as_bytes();
    // a trailing separator turns the pattern into a directory prefix that
    // also matches everything beneath it
    let dir_prefix = !anchored_end && pat.last() == Some(&sep);

    if pat.first() == Some(&sep) {
        return glob(pat, text, sep, dir_prefix);
    }
    // unanchored: try the start and every component boundary
    let mut start = 0usize;
    loop {
        if glob(pat, &text[start..], sep, dir_prefix) {
            return true;
        }
        match text[start..].iter().position(|&b| b == sep) {
            Some(i) => start += i + 1,
            None => return false,
        }
    }
}

fn glob(pat: &[u8], text: &[u8], sep: u8, accept_tail: bool) -> bool {
    match pat.split_first() {
        None => accept_tail || text.is_empty(),
        Some((&b'*', rest)) if rest.first() == Some(&b'*') => {
            let rest = &rest[1..];
            (0..=text.len()).any(|i| glob(rest, &text[i..], sep, accept_tail))
        }
        Some((&b'*', rest)) => {
            for i in 0..=text.len() {
                if glob(rest, &text[i..], sep, accept_tail) {
                    return true;
                }
                if i < text.len() && text[i] == sep {
                    break;
                }
            }
            false
        }
        Some((&b'?', rest)) => {
            !text.is_empty() && text[0] != sep && glob(rest, &text[1..], sep, accept_tail)
        }
        Some((&c, rest)) => text.first() == Some(&c) && glob(rest, &text[1..], sep, accept_tail),
    }
}

struct MacroDef {
    name: &'static str,
    expand: &'static str,
}

const MACRO_TAB: &[MacroDef] = &[
    MacroDef { name: "base", expand: "+/*$" },
    MacroDef { name: "nobase", expand: "-/*$" },
    MacroDef { name: "disc", expand: "+/disc/" },
    MacroDef { name: "nodisc", expand: "-/disc/" },
    MacroDef { name: "sys", expand: "+/sys/" },
    MacroDef { name: "nosys", expand: "-/sys/" },
    MacroDef { name: "files", expand: "+/files/" },
    MacroDef { name: "nofiles", expand: "-/files/" },
    MacroDef { name: "wit", expand: "4+/h3.bin;3+/sys/user.bin;2+/sys/fst.bin;1+/sys/fst+.bin;+" },
    MacroDef { name: "wwt", expand: "4+/h3.bin;3+/sys/user.bin;2+/sys/fst.bin;1+/sys/fst+.bin;+" },
    MacroDef { name: "compose", expand: "+/cert.bin;4+/disc/;3+/*$;2+/sys/fst.bin;1+/sys/fst+.bin;+" },
    MacroDef { name: "neek", expand: "3+/setup.txt;2+/h3.bin;1+/disc/;+" },
    MacroDef { name: "sneek", expand: "3+/setup.txt;2+/h3.bin;1+/disc/;+" },
];

/// An ordered ruleset plus its negation state.
#[derive(Debug, Clone, Default)]
pub struct FilePattern {
    rules: Vec<String>,
    is_active: bool,
    is_dirty: bool,
    match_all: bool,
    match_none: bool,
    macro_negate: bool,
    user_negate: bool,
    active_negate: bool,
}

impl FilePattern {
    pub fn new() -> Self {
        FilePattern {
            match_all: true,
            ..FilePattern::default()
        }
    }

    pub fn reset(&mut self) {
        *self = FilePattern::new();
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    /// Add one or more semicolon separated rules; `:name` expands a macro.
    pub fn add_rules(&mut self, arg: &str) -> WdResult<()> {
        self.is_active = true;
        for item in arg.split(';') {
            if item.is_empty() {
                continue;
            }
            // `=` is obsolete and compatible to `:`
            if let Some(name) = item.strip_prefix(':').or_else(|| item.strip_prefix('=')) {
                if name == "negate" {
                    self.macro_negate = true;
                    self.active_negate = self.macro_negate != self.user_negate;
                    continue;
                }
                let def = MACRO_TAB
                    .iter()
                    .find(|m| m.name == name)
                    .ok_or_else(|| WdError::Syntax(format!("macro '{name}' not found")))?;
                self.add_rules(def.expand)?;
                continue;
            }
            let mut rest = item;
            if rest.starts_with(|c: char| c.is_ascii_digit() && c != '0') {
                let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
                rest = &rest[digits..];
            }
            if !rest.starts_with('+') && !rest.starts_with('-') {
                return Err(WdError::Syntax(format!(
                    "file pattern rule must begin with '+', '-' or ':' => {item}"
                )));
            }
            self.rules.push(item.to_owned());
            self.is_dirty = true;
        }
        Ok(())
    }

    pub fn set_user_negate(&mut self, negate: bool) {
        self.user_negate = negate;
        self.active_negate = self.macro_negate != self.user_negate;
    }

    /// Re-derive the shortcut flags. Returns whether any file can match at
    /// all.
    pub fn setup(&mut self) -> bool {
        if self.is_dirty {
            self.is_active = true;
            self.is_dirty = false;
            self.match_all = false;
            self.match_none = false;
            match self.rules.first().map(String::as_str) {
                None => self.match_all = true,
                Some("+") | Some("+*") | Some("+**") => self.match_all = true,
                Some("-") | Some("-*") | Some("-**") => self.match_none = true,
                Some(_) => {}
            }
        }
        self.active_negate = self.macro_negate != self.user_negate;
        self.is_active && !self.match_none
    }

    /// Evaluate the ruleset for `text`.
    pub fn matches(&mut self, text: &str, sep: char) -> bool {
        if self.is_dirty {
            self.setup();
        }
        if self.match_all {
            return !self.active_negate;
        }
        if self.match_none {
            return self.active_negate;
        }

        let mut default_result = !self.active_negate;
        let mut skip: i64 = 0;
        for rule in &self.rules {
            let consider = skip <= 0;
            skip -= 1;
            let bytes = rule.as_bytes();
            match bytes[0] {
                b'-' => {
                    if consider && match_pattern(&rule[1..], text, sep) {
                        return self.active_negate;
                    }
                    default_result = !self.active_negate;
                }
                b'+' => {
                    if consider && match_pattern(&rule[1..], text, sep) {
                        return !self.active_negate;
                    }
                    default_result = self.active_negate;
                }
                _ => {
                    if consider {
                        let digits = rule
                            .find(|c: char| !c.is_ascii_digit())
                            .unwrap_or(rule.len());
                        let n: i64 = rule[..digits].parse().unwrap_or(0);
                        let rest = &rule[digits..];
                        // conditional skip: on match, skip the next N rules
                        if let Some(pat) = rest.strip_prefix('+').or_else(|| rest.strip_prefix('-'))
                        {
                            if match_pattern(pat, text, sep) {
                                skip = n;
                            }
                        }
                    }
                }
            }
        }
        default_result
    }
}

/// The process-wide ruleset slots, modeled as a registry keyed by an enum
/// rather than ambient globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSlot {
    Files,
    RmFiles,
    ZeroFiles,
    IgnoreFiles,
    FakeSign,
    Default,
    Param,
}

impl PatternSlot {
    pub const COUNT: usize = 7;

    fn index(&self) -> usize {
        match self {
            PatternSlot::Files => 0,
            PatternSlot::RmFiles => 1,
            PatternSlot::ZeroFiles => 2,
            PatternSlot::IgnoreFiles => 3,
            PatternSlot::FakeSign => 4,
            PatternSlot::Default => 5,
            PatternSlot::Param => 6,
        }
    }
}

#[derive(Debug, Default)]
pub struct PatternRegistry {
    slots: [FilePattern; PatternSlot::COUNT],
}

impl PatternRegistry {
    pub fn new() -> Self {
        let mut reg = PatternRegistry::default();
        for slot in reg.slots.iter_mut() {
            *slot = FilePattern::new();
        }
        reg
    }

    pub fn get_mut(&mut self, slot: PatternSlot) -> &mut FilePattern {
        &mut self.slots[slot.index()]
    }

    /// The pattern for `slot`, falling back to the default slot while the
    /// requested one has no rules.
    pub fn effective_mut(&mut self, slot: PatternSlot) -> &mut FilePattern {
        let index = if self.slots[slot.index()].rule_count() == 0 {
            PatternSlot::Default.index()
        } else {
            slot.index()
        };
        &mut self.slots[index]
    }

    /// Move the accumulated parameter rules into `slot`, resetting the
    /// parameter slot.
    pub fn move_param(&mut self, slot: PatternSlot) {
        let mut param = std::mem::take(&mut self.slots[PatternSlot::Param.index()]);
        param.setup();
        self.slots[slot.index()] = param;
        self.slots[PatternSlot::Param.index()] = FilePattern::new();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pat(rules: &[&str]) -> FilePattern {
        let mut p = FilePattern::new();
        for rule in rules {
            p.add_rules(rule).unwrap();
        }
        p.setup();
        p
    }

    #[test]
    fn glob_basics() {
        assert!(match_pattern("/disc/", "/disc/foo.bin", '/'));
        assert!(match_pattern("/disc/", "/disc/", '/'));
        assert!(!match_pattern("/disc/", "/discx/foo", '/'));
        assert!(match_pattern("*.bin", "/a.bin", '/'));
        assert!(match_pattern("*.bin", "/sound/se/a.bin", '/'));
        assert!(!match_pattern("*.bin", "/a.binx", '/'));
        assert!(match_pattern("/*$", "/a.bin", '/'));
        assert!(!match_pattern("/*$", "/sys/a.bin", '/'));
        assert!(match_pattern("/**", "/any/depth/file", '/'));
        assert!(match_pattern("/sys/?st.bin", "/sys/fst.bin", '/'));
        assert!(!match_pattern("/sys/?st.bin", "/sys/st.bin", '/'));
    }

    #[test]
    fn include_exclude_rules() {
        let mut p = pat(&["+/disc/", "-/**"]);
        assert!(p.matches("/disc/foo.bin", '/'));
        assert!(!p.matches("/sys/x", '/'));
        assert!(!p.matches("/other", '/'));
    }

    #[test]
    fn trailing_exclude_implies_include_all_else() {
        let mut p = pat(&["-/update/"]);
        assert!(!p.matches("/update/x", '/'));
        assert!(p.matches("/files/x", '/'));
    }

    #[test]
    fn skip_rules_skip_on_match() {
        let mut p = pat(&["2-*.bin", "+/a.bin", "-/b.bin", "+/c.bin"]);
        // /a.bin: skip rule matches, the include is skipped, tail default
        // after the non-matching "+/c.bin" is exclude
        assert!(!p.matches("/a.bin", '/'));
        // /c.txt: skip rule does not match, include/exclude rules do not
        // match, last rule is "+" so default is exclude
        assert!(!p.matches("/c.txt", '/'));
        // /c.bin: skip matches, "+/a.bin" and "-/b.bin" are skipped,
        // "+/c.bin" decides include
        assert!(p.matches("/c.bin", '/'));
    }

    #[test]
    fn match_all_and_none_shortcuts() {
        let mut all = pat(&["+"]);
        assert!(all.matches("/anything", '/'));
        let mut none = pat(&["-**"]);
        assert!(!none.matches("/anything", '/'));
        none.set_user_negate(true);
        assert!(none.matches("/anything", '/'));
    }

    #[test]
    fn negate_macro_xors_with_user() {
        let mut p = pat(&[":negate", "+/sys/"]);
        assert!(!p.matches("/sys/boot.bin", '/'));
        p.set_user_negate(true);
        assert!(p.matches("/sys/boot.bin", '/'));
    }

    #[test]
    fn compose_macro_expands() {
        let mut p = FilePattern::new();
        p.add_rules(":compose").unwrap();
        assert_eq!(
            p.rules(),
            &["+/cert.bin", "4+/disc/", "3+/*$", "2+/sys/fst.bin", "1+/sys/fst+.bin", "+"]
        );
    }

    #[test]
    fn bad_rules_are_syntax_errors() {
        let mut p = FilePattern::new();
        assert!(p.add_rules("foo").is_err());
        assert!(p.add_rules(":nosuchmacro").is_err());
    }

    #[test]
    fn registry_falls_back_to_default() {
        let mut reg = PatternRegistry::new();
        reg.get_mut(PatternSlot::Default).add_rules("-/**").unwrap();
        assert!(!reg
            .effective_mut(PatternSlot::Files)
            .matches("/file", '/'));
        reg.get_mut(PatternSlot::Files).add_rules("+/**").unwrap();
        assert!(reg.effective_mut(PatternSlot::Files).matches("/file", '/'));
    }
}
