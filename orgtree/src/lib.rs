//! Org outline parser: turns Org-mode text into a typed document tree.
//! Two stages run in sequence: a line tokenizer (`tokens`) and a recursive-descent
//! parser (`parser`). Renderers consume the tree; nothing here writes Org text back.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /// Ordered TODO keyword groups; a new group starts at every `|` in the `TODO` setting.
    pub type TodoGroups = Vec<Vec<String>>;

    /* ------------------------------ Aggregate ------------------------------ */

    /// Root of a parsed document: file metadata plus the top-level content.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Document {
        pub meta: DocumentMeta,

        /// Content before and including the top-level sections, in source order.
        #[serde(default)]
        pub content: Vec<Node>,
    }

    impl Document {
        pub fn new(meta: DocumentMeta) -> Self {
            Self {
                meta,
                content: vec![],
            }
        }

        pub fn children(&self) -> &[Node] {
            &self.content
        }

        pub fn settings(&self) -> &IndexMap<String, String> {
            &self.meta.settings
        }

        /// Value of the `TITLE` setting, if any.
        pub fn title(&self) -> Option<&str> {
            self.meta.title()
        }

        pub fn todos(&self) -> TodoGroups {
            self.meta.todos()
        }
    }

    /* ----------------------------- Document meta ----------------------------- */

    /// `#+KEY: value` settings collected from the top of the document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DocumentMeta {
        /// Keys are unique ignoring ASCII case; the spelling of the last write is kept.
        #[serde(default)]
        pub settings: IndexMap<String, String>,

        /// Keyword groups used when the document has no `TODO` setting.
        pub default_todos: TodoGroups,
    }

    impl Default for DocumentMeta {
        fn default() -> Self {
            Self::new(Self::builtin_todos())
        }
    }

    impl DocumentMeta {
        pub fn new(default_todos: TodoGroups) -> Self {
            Self {
                settings: IndexMap::new(),
                default_todos,
            }
        }

        pub fn builtin_todos() -> TodoGroups {
            vec![vec!["TODO".to_string()], vec!["DONE".to_string()]]
        }

        /// Upserts a setting. A later value for the same key replaces the earlier one.
        pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
            let key = key.into();
            self.settings.retain(|k, _| !k.eq_ignore_ascii_case(&key));
            self.settings.insert(key, value.into());
        }

        pub fn setting(&self, name: &str) -> Option<&str> {
            self.settings
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn title(&self) -> Option<&str> {
            self.setting("TITLE")
        }

        pub fn todos(&self) -> TodoGroups {
            match self.setting("TODO") {
                Some(value) => crate::settings::todo_groups(value),
                None => self.default_todos.clone(),
            }
        }
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// One node of the document tree. Ownership runs strictly from the root down.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Node {
        Section(Section),
        Paragraph(Paragraph),
        List(List),
        Block(Block),
        Comment { text: Option<String> },
        Blank,
    }

    impl Node {
        pub fn as_section(&self) -> Option<&Section> {
            match self {
                Node::Section(section) => Some(section),
                _ => None,
            }
        }

        /// Child nodes; only sections own nested content.
        pub fn children(&self) -> &[Node] {
            match self {
                Node::Section(section) => section.children.as_slice(),
                _ => &[],
            }
        }
    }

    /// A headline and the content it structurally owns.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        /// Star count of the headline; always >= 1.
        pub level: usize,
        pub title: Option<String>,

        /// TODO groups in effect when the section was created.
        #[serde(default)]
        pub todos: TodoGroups,

        #[serde(default)]
        pub children: Vec<Node>,
    }

    impl Section {
        pub fn new(level: usize, title: Option<String>, todos: TodoGroups) -> Self {
            Self {
                level,
                title,
                todos,
                children: vec![],
            }
        }

        /// Leading TODO keyword of the title, resolved against the frozen groups.
        pub fn keyword(&self) -> Option<TodoKeyword> {
            let first = self.title.as_deref()?.split_whitespace().next()?;
            for (index, group) in self.todos.iter().enumerate() {
                let Some(pos) = group.iter().position(|k| k == first) else {
                    continue;
                };
                let is_done = if self.todos.len() > 1 {
                    index > 0
                } else {
                    group.len() > 1 && pos + 1 == group.len()
                };
                return Some(TodoKeyword {
                    text: first.to_string(),
                    is_done,
                });
            }
            None
        }

        /// Title without its TODO keyword.
        pub fn headline(&self) -> Option<&str> {
            let title = self.title.as_deref()?.trim_start();
            match self.keyword() {
                Some(keyword) => Some(title[keyword.text.len()..].trim_start()),
                None => Some(title),
            }
        }
    }

    /// Todo keyword with a "done" flag so we can respect file-specific vocabularies.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoKeyword {
        pub text: String,
        pub is_done: bool,
    }

    /// Consecutive prose lines.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Paragraph {
        pub lines: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct List {
        /// Fixed by the first item's bullet.
        pub ordered: bool,
        pub items: Vec<ListItem>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListItem {
        pub text: Option<String>,
        pub checked: Option<bool>,

        /// Items indented deeper than this one.
        pub list: Option<List>,
    }

    impl ListItem {
        pub fn new(text: Option<String>, checked: Option<bool>) -> Self {
            Self {
                text,
                checked,
                list: None,
            }
        }
    }

    /// Verbatim region between `#+begin_NAME` and `#+end_NAME`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Block {
        pub name: String,
        pub params: Option<Vec<String>>,
        #[serde(default)]
        pub content: Vec<String>,
    }

    impl Block {
        pub fn new(name: String, params: Option<Vec<String>>) -> Self {
            Self {
                name,
                params,
                content: vec![],
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn settings_upsert_ignores_key_case() {
            let mut meta = DocumentMeta::default();
            meta.set("TITLE", "First");
            meta.set("author", "me");
            meta.set("title", "Second");

            assert_eq!(meta.settings.len(), 2);
            assert_eq!(meta.title(), Some("Second"));
            assert_eq!(meta.setting("AUTHOR"), Some("me"));
        }

        #[test]
        fn todos_fall_back_to_defaults() {
            let custom = vec![vec!["NEXT".to_string()], vec!["DONE".to_string()]];
            let mut meta = DocumentMeta::new(custom.clone());
            assert_eq!(meta.todos(), custom);

            meta.set("TODO", "A B | C");
            assert_eq!(meta.todos(), vec![vec!["A", "B"], vec!["C"]]);
        }

        #[test]
        fn keyword_done_state_follows_groups() {
            let groups = vec![
                vec!["TODO".to_string(), "WAIT".to_string()],
                vec!["DONE".to_string()],
            ];
            let wait = Section::new(1, Some("WAIT on review".into()), groups.clone());
            let done = Section::new(1, Some("DONE ship it".into()), groups.clone());
            let plain = Section::new(1, Some("Notes".into()), groups);

            assert_eq!(
                wait.keyword(),
                Some(TodoKeyword {
                    text: "WAIT".into(),
                    is_done: false
                })
            );
            assert_eq!(wait.headline(), Some("on review"));
            assert!(done.keyword().is_some_and(|k| k.is_done));
            assert_eq!(plain.keyword(), None);
            assert_eq!(plain.headline(), Some("Notes"));
        }

        #[test]
        fn single_group_marks_last_keyword_done() {
            let groups = vec![vec!["TODO".to_string(), "FIXED".to_string()]];
            let open = Section::new(2, Some("TODO a".into()), groups.clone());
            let fixed = Section::new(2, Some("FIXED b".into()), groups);
            assert!(open.keyword().is_some_and(|k| !k.is_done));
            assert!(fixed.keyword().is_some_and(|k| k.is_done));
        }
    }
}

pub mod tokens {
    //! Line tokenizer.
    //!
    //! Each input line maps to exactly one [`Token`]. Rules are tried in a fixed order and the
    //! first full-line match wins; the catch-all `line` rule comes last, so tokenizing never fails.

    use once_cell::sync::Lazy;
    use regex::{Captures, Regex, RegexBuilder};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum Token {
        Setting {
            key: String,
            value: String,
        },
        Headline {
            level: usize,
            text: Option<String>,
        },
        Blank,
        HorizontalRule,
        BlockBegin {
            name: String,
            params: Option<Vec<String>>,
        },
        BlockEnd {
            name: String,
        },
        DrawerBegin {
            name: String,
        },
        DrawerEnd,
        ListItem {
            indent: usize,
            text: Option<String>,
            ordered: bool,
            checked: Option<bool>,
        },
        Comment {
            text: Option<String>,
        },
        Line {
            text: String,
        },
        Footnote {
            label: String,
            content: Option<String>,
        },
    }

    /// Where a token came from.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TokenMeta {
        /// 1-based source line.
        pub line: usize,
        /// The source line verbatim; `None` for tokens built by hand.
        pub raw: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TokenWithMeta {
        pub meta: TokenMeta,
        pub token: Token,
    }

    impl TokenWithMeta {
        /// Wraps hand-built tokens, numbering them by position.
        pub fn from_tokens(tokens: impl IntoIterator<Item = Token>) -> Vec<TokenWithMeta> {
            tokens
                .into_iter()
                .enumerate()
                .map(|(index, token)| TokenWithMeta {
                    meta: TokenMeta {
                        line: index + 1,
                        raw: None,
                    },
                    token,
                })
                .collect()
        }
    }

    /* ------------------------------ Rule table ------------------------------ */

    type Constructor = fn(&Captures<'_>) -> Token;

    struct Rule {
        name: &'static str,
        pattern: Regex,
        build: Constructor,
    }

    fn rule(name: &'static str, pattern: &str, case_insensitive: bool, build: Constructor) -> Rule {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .expect("token patterns are valid regexes");
        Rule {
            name,
            pattern,
            build,
        }
    }

    fn group(caps: &Captures<'_>, index: usize) -> Option<String> {
        caps.get(index).map(|m| m.as_str().to_string())
    }

    fn indent(caps: &Captures<'_>, index: usize) -> usize {
        caps.get(index).map_or(0, |m| m.as_str().chars().count())
    }

    /// Compiled once on first use, read-only afterwards.
    static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
        vec![
            rule("blank", r"^\s*$", false, |_| Token::Blank),
            rule("setting", r"^#\+([a-zA-Z_]+):\s*(.*)$", false, |c| {
                Token::Setting {
                    key: group(c, 1).unwrap_or_default(),
                    value: group(c, 2).unwrap_or_default(),
                }
            }),
            rule("headline", r"^(\*+)\s+(.*)$", false, |c| Token::Headline {
                level: indent(c, 1),
                text: group(c, 2),
            }),
            rule(
                "block_begin",
                r"^(\s*)#\+begin_([a-z]+)(?:\s+(.*))?$",
                true,
                |c| Token::BlockBegin {
                    name: group(c, 2).unwrap_or_default(),
                    params: group(c, 3).map(|p| {
                        p.split(' ')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    }),
                },
            ),
            rule("block_end", r"^(\s*)#\+end_([a-z]+)$", true, |c| {
                Token::BlockEnd {
                    name: group(c, 2).unwrap_or_default(),
                }
            }),
            rule("drawer_end", r"^(\s*):end:\s*$", true, |_| Token::DrawerEnd),
            rule("drawer_begin", r"^(\s*):([a-z]+):\s*$", true, |c| {
                Token::DrawerBegin {
                    name: group(c, 2).unwrap_or_default(),
                }
            }),
            rule(
                "list_item",
                r"^(\s*)([-+*]|\d+(?:\.|\)))\s+(?:\[([ X-])\]\s+)?(.*)$",
                false,
                |c| Token::ListItem {
                    indent: indent(c, 1),
                    text: group(c, 4),
                    ordered: !matches!(c.get(2).map(|m| m.as_str()), Some("-" | "+" | "*")),
                    checked: c.get(3).map(|m| m.as_str() == "X"),
                },
            ),
            rule("horizontal_rule", r"^\s*-{5,}$", false, |_| {
                Token::HorizontalRule
            }),
            rule("comment", r"^\s*#\s+(.*)$", false, |c| Token::Comment {
                text: group(c, 1),
            }),
            rule("footnote", r"^\[fn:(\d+)\](?:\s+(.*))?$", false, |c| {
                Token::Footnote {
                    label: group(c, 1).unwrap_or_default(),
                    content: group(c, 2),
                }
            }),
            rule("line", r"^(\s*)(.*)$", false, |c| Token::Line {
                text: group(c, 2).unwrap_or_default(),
            }),
        ]
    });

    /* ------------------------ Public entry points ------------------------ */

    /// Classifies a single line.
    pub fn tokenize_line(line: &str) -> Token {
        for rule in RULES.iter() {
            if let Some(caps) = rule.pattern.captures(line) {
                let token = (rule.build)(&caps);
                log::trace!("{} -> {:?}", rule.name, token);
                return token;
            }
        }
        // Only reachable for text containing a line break.
        Token::Line {
            text: line.trim_start().to_string(),
        }
    }

    /// Tokenizes lines in order, one token per line.
    pub fn tokenize<I, S>(lines: I) -> Vec<TokenWithMeta>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        lines
            .into_iter()
            .enumerate()
            .map(|(index, line)| {
                let line = line.as_ref();
                TokenWithMeta {
                    meta: TokenMeta {
                        line: index + 1,
                        raw: Some(line.to_string()),
                    },
                    token: tokenize_line(line),
                }
            })
            .collect()
    }

    pub fn tokenize_str(content: &str) -> Vec<TokenWithMeta> {
        tokenize(content.lines())
    }

}

pub mod settings {
    //! Parsing of setting values that change how later content is classified.

    use crate::core::TodoGroups;
    use nom::{
        IResult,
        bytes::complete::take_till1,
        character::complete::{multispace0, multispace1},
        multi::separated_list0,
        sequence::delimited,
    };

    fn words(i: &str) -> IResult<&str, Vec<&str>> {
        delimited(
            multispace0,
            separated_list0(
                multispace1,
                take_till1(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n')),
            ),
            multispace0,
        )(i)
    }

    /// Splits a `TODO` setting value into keyword groups at each literal `|`.
    pub fn todo_groups(value: &str) -> TodoGroups {
        let keywords = words(value).map(|(_, w)| w).unwrap_or_default();
        let mut groups: TodoGroups = vec![vec![]];
        for keyword in keywords {
            if keyword == "|" {
                groups.push(vec![]);
            } else if let Some(current) = groups.last_mut() {
                current.push(keyword.to_string());
            }
        }
        groups
    }

}

pub mod parser {
    //! Recursive-descent parser over the token queue.
    //!
    //! Section nesting comes from comparing headline levels with the nearest enclosing
    //! section; list nesting from comparing indents with the list's first item. The call
    //! stack is the nesting stack, bounded by [`ParseOptions::max_depth`].

    use crate::core::*;
    use crate::tokens::{Token, TokenMeta, TokenWithMeta, tokenize, tokenize_str};
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ParseError {
        #[error("unexpected token: {0}")]
        UnexpectedToken(String),
    }

    pub type ParseResult<T> = Result<T, ParseError>;

    fn unexpected(expected: &str, found: Option<(&Token, &TokenMeta)>) -> ParseError {
        match found {
            Some((token, meta)) => ParseError::UnexpectedToken(format!(
                "{expected} expected, but got {token:?} at line {}",
                meta.line
            )),
            None => ParseError::UnexpectedToken(format!(
                "{expected} expected, but reached end of input"
            )),
        }
    }

    /* ------------------------------ Options ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ParseOptions {
        /// Keyword groups used when a document has no `TODO` setting.
        pub default_todos: TodoGroups,
        /// Maximum combined section/list nesting.
        pub max_depth: usize,
    }

    impl Default for ParseOptions {
        fn default() -> Self {
            Self {
                default_todos: DocumentMeta::builtin_todos(),
                max_depth: 512,
            }
        }
    }

    /* ------------------------------ Token queue ------------------------------ */

    #[derive(Debug, Clone, Default)]
    pub struct TokenQueue {
        items: VecDeque<TokenWithMeta>,
    }

    impl TokenQueue {
        pub fn new(tokens: Vec<TokenWithMeta>) -> Self {
            Self {
                items: tokens.into(),
            }
        }

        pub fn peek(&self) -> Option<&Token> {
            self.items.front().map(|t| &t.token)
        }

        pub fn front(&self) -> Option<&TokenWithMeta> {
            self.items.front()
        }

        pub fn dequeue(&mut self) -> Option<TokenWithMeta> {
            self.items.pop_front()
        }

        /// Dequeues the front token only when `pred` accepts it.
        pub fn next_if(&mut self, pred: impl FnOnce(&Token) -> bool) -> Option<TokenWithMeta> {
            match self.items.front() {
                Some(front) if pred(&front.token) => self.items.pop_front(),
                _ => None,
            }
        }

        pub fn len(&self) -> usize {
            self.items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.items.is_empty()
        }
    }

    /* ------------------------------ Ancestry ------------------------------ */

    /// Non-owning link to the enclosing node, living on the call stack only while that
    /// node is being built. Answers level and TODO lookups; never part of the tree.
    struct Scope<'a> {
        kind: ScopeKind<'a>,
        parent: Option<&'a Scope<'a>>,
    }

    enum ScopeKind<'a> {
        Document(&'a DocumentMeta),
        Section(usize),
    }

    impl<'a> Scope<'a> {
        fn document(meta: &'a DocumentMeta) -> Self {
            Self {
                kind: ScopeKind::Document(meta),
                parent: None,
            }
        }

        fn section(level: usize, parent: &'a Scope<'a>) -> Self {
            Self {
                kind: ScopeKind::Section(level),
                parent: Some(parent),
            }
        }

        fn ancestors(&'a self) -> impl Iterator<Item = &'a Scope<'a>> {
            std::iter::successors(Some(self), |s| s.parent)
        }
    }

    /// Level of the nearest enclosing section; the document root is level 0.
    fn current_level(scope: &Scope<'_>) -> usize {
        scope
            .ancestors()
            .find_map(|s| match s.kind {
                ScopeKind::Section(level) => Some(level),
                ScopeKind::Document(_) => None,
            })
            .unwrap_or(0)
    }

    /// TODO groups of the enclosing document, frozen onto new sections.
    fn get_todos(scope: &Scope<'_>) -> TodoGroups {
        let meta = scope.ancestors().find_map(|s| match s.kind {
            ScopeKind::Document(meta) => Some(meta),
            ScopeKind::Section(_) => None,
        });
        match meta {
            Some(meta) => meta.todos(),
            None => {
                log::warn!("no document metadata above this section; using no TODO keywords");
                vec![]
            }
        }
    }

    /* ------------------------------ Parser ------------------------------ */

    #[derive(Debug, Clone)]
    pub struct Parser {
        tokens: TokenQueue,
        options: ParseOptions,
    }

    impl Parser {
        /// Parser over hand-built tokens.
        pub fn new(tokens: Vec<Token>) -> Self {
            Self::from_tokens(TokenWithMeta::from_tokens(tokens))
        }

        pub fn from_tokens(tokens: Vec<TokenWithMeta>) -> Self {
            Self {
                tokens: TokenQueue::new(tokens),
                options: ParseOptions::default(),
            }
        }

        pub fn from_lines<I, S>(lines: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: AsRef<str>,
        {
            Self::from_tokens(tokenize(lines))
        }

        pub fn from_content(content: &str) -> Self {
            Self::from_tokens(tokenize_str(content))
        }

        pub fn with_options(mut self, options: ParseOptions) -> Self {
            self.options = options;
            self
        }

        /// Builds the document tree, consuming the queued tokens.
        pub fn parse(&mut self) -> ParseResult<Document> {
            self.parse_document()
        }

        fn parse_document(&mut self) -> ParseResult<Document> {
            log::debug!("parsing document from {} tokens", self.tokens.len());
            let mut document = Document::new(DocumentMeta::new(self.options.default_todos.clone()));

            while let Some(next) = self.tokens.front() {
                if matches!(next.token, Token::Setting { .. }) {
                    if let Some(TokenWithMeta {
                        token: Token::Setting { key, value },
                        meta,
                    }) = self.tokens.dequeue()
                    {
                        log::debug!("setting {} at line {}", key, meta.line);
                        document.meta.set(key, value);
                    }
                    continue;
                }
                let remaining = self.tokens.len();
                let Document { meta, content } = &mut document;
                let root = Scope::document(meta);
                self.parse_section(&root, content, 0)?;
                if self.tokens.len() == remaining {
                    let stuck = self.tokens.front().map(|t| (&t.token, &t.meta));
                    return Err(unexpected("document content", stuck));
                }
            }

            Ok(document)
        }

        fn check_depth(&self, depth: usize) -> ParseResult<()> {
            if depth <= self.options.max_depth {
                return Ok(());
            }
            let line = self
                .tokens
                .front()
                .map(|t| format!(" at line {}", t.meta.line))
                .unwrap_or_default();
            Err(ParseError::UnexpectedToken(format!(
                "nesting depth {depth} exceeds limit {}{line}",
                self.options.max_depth
            )))
        }

        fn parse_section(
            &mut self,
            parent: &Scope<'_>,
            children: &mut Vec<Node>,
            depth: usize,
        ) -> ParseResult<()> {
            while let Some(next) = self.tokens.front() {
                match &next.token {
                    Token::Headline { level, .. } => {
                        let level = *level;
                        if level == 0 {
                            return Err(unexpected(
                                "Headline with level >= 1",
                                Some((&next.token, &next.meta)),
                            ));
                        }
                        if level <= current_level(parent) {
                            return Ok(());
                        }
                        self.check_depth(depth + 1)?;
                        let Some(TokenWithMeta {
                            token: Token::Headline { text, .. },
                            meta,
                        }) = self.tokens.dequeue()
                        else {
                            return Err(unexpected("Headline", None));
                        };
                        log::debug!("section level {} at line {}", level, meta.line);

                        let mut section = Section::new(level, text, get_todos(parent));
                        let scope = Scope::section(level, parent);
                        self.parse_section(&scope, &mut section.children, depth + 1)?;
                        children.push(Node::Section(section));
                    }
                    Token::Blank => {
                        self.tokens.dequeue();
                        children.push(Node::Blank);
                    }
                    Token::Line { .. } => children.push(Node::Paragraph(self.parse_lines()?)),
                    Token::Comment { text } => {
                        let text = text.clone();
                        self.tokens.dequeue();
                        children.push(Node::Comment { text });
                    }
                    Token::BlockBegin { .. } => children.push(Node::Block(self.parse_block()?)),
                    Token::ListItem { .. } => {
                        children.push(Node::List(self.parse_list(depth + 1)?));
                    }
                    Token::Setting { .. }
                    | Token::HorizontalRule
                    | Token::BlockEnd { .. }
                    | Token::DrawerBegin { .. }
                    | Token::DrawerEnd
                    | Token::Footnote { .. } => {
                        return Err(ParseError::UnexpectedToken(format!(
                            "{:?} is not expected at line {}",
                            next.token, next.meta.line
                        )));
                    }
                }
            }
            Ok(())
        }

        fn parse_lines(&mut self) -> ParseResult<Paragraph> {
            let first = match self.tokens.dequeue() {
                Some(TokenWithMeta {
                    token: Token::Line { text },
                    ..
                }) => text,
                Some(other) => return Err(unexpected("Line", Some((&other.token, &other.meta)))),
                None => return Err(unexpected("Line", None)),
            };

            let mut paragraph = Paragraph { lines: vec![first] };
            while let Some(TokenWithMeta {
                token: Token::Line { text },
                ..
            }) = self.tokens.next_if(|t| matches!(t, Token::Line { .. }))
            {
                paragraph.lines.push(text);
            }
            Ok(paragraph)
        }

        fn parse_block(&mut self) -> ParseResult<Block> {
            let (opened_at, mut block) = match self.tokens.dequeue() {
                Some(TokenWithMeta {
                    token: Token::BlockBegin { name, params },
                    meta,
                }) => (meta.line, Block::new(name, params)),
                Some(other) => {
                    return Err(unexpected("BlockBegin", Some((&other.token, &other.meta))));
                }
                None => return Err(unexpected("BlockBegin", None)),
            };

            while let Some(TokenWithMeta { meta, token }) = self.tokens.dequeue() {
                match token {
                    Token::BlockEnd { name } => {
                        if !name.eq_ignore_ascii_case(&block.name) {
                            return Err(ParseError::UnexpectedToken(format!(
                                "expecting BlockEnd of type {}, but got {} at line {}",
                                block.name, name, meta.line
                            )));
                        }
                        log::debug!(
                            "block {} spans lines {}..={}",
                            block.name,
                            opened_at,
                            meta.line
                        );
                        return Ok(block);
                    }
                    nested @ Token::BlockBegin { .. } => {
                        return Err(unexpected("raw content or BlockEnd", Some((&nested, &meta))));
                    }
                    Token::Line { text } if meta.raw.is_none() => block.content.push(text),
                    other => {
                        let Some(raw) = &meta.raw else {
                            return Err(unexpected(
                                "raw content or BlockEnd",
                                Some((&other, &meta)),
                            ));
                        };
                        block.content.push(raw.clone());
                    }
                }
            }

            Err(ParseError::UnexpectedToken(format!(
                "no BlockEnd for {} block opened at line {}",
                block.name, opened_at
            )))
        }

        fn parse_list(&mut self, depth: usize) -> ParseResult<List> {
            self.check_depth(depth)?;
            let (indent, mut list) = match self.tokens.dequeue() {
                Some(TokenWithMeta {
                    token:
                        Token::ListItem {
                            indent,
                            text,
                            ordered,
                            checked,
                        },
                    ..
                }) => (
                    indent,
                    List {
                        ordered,
                        items: vec![ListItem::new(text, checked)],
                    },
                ),
                Some(other) => {
                    return Err(unexpected("ListItem", Some((&other.token, &other.meta))));
                }
                None => return Err(unexpected("ListItem", None)),
            };

            while let Some(&Token::ListItem { indent: next, .. }) = self.tokens.peek() {
                if next > indent {
                    let nested = self.parse_list(depth + 1)?;
                    if let Some(previous) = list.items.last_mut() {
                        match previous.list.as_mut() {
                            // A shallower-but-still-deeper run after a deeper one joins it.
                            Some(existing) => existing.items.extend(nested.items),
                            None => previous.list = Some(nested),
                        }
                    }
                } else if next == indent {
                    if let Some(TokenWithMeta {
                        token: Token::ListItem { text, checked, .. },
                        ..
                    }) = self.tokens.dequeue()
                    {
                        list.items.push(ListItem::new(text, checked));
                    }
                } else {
                    break;
                }
            }

            Ok(list)
        }
    }

    /// Parses a whole document held in memory with default options.
    pub fn parse_document_str(content: &str) -> ParseResult<Document> {
        Parser::from_content(content).parse()
    }

}

pub mod query {
    //! Read-only traversal helpers over a parsed tree.

    use crate::core::{Document, Node, Section};
    use std::fmt::Write;

    /// Depth-first, pre-order walk over every section.
    pub struct Sections<'a> {
        stack: Vec<std::slice::Iter<'a, Node>>,
    }

    impl<'a> Iterator for Sections<'a> {
        type Item = &'a Section;

        fn next(&mut self) -> Option<&'a Section> {
            while let Some(iter) = self.stack.last_mut() {
                match iter.next() {
                    Some(Node::Section(section)) => {
                        self.stack.push(section.children.iter());
                        return Some(section);
                    }
                    Some(_) => continue,
                    None => {
                        self.stack.pop();
                    }
                }
            }
            None
        }
    }

    pub fn sections(doc: &Document) -> Sections<'_> {
        Sections {
            stack: vec![doc.content.iter()],
        }
    }

    /// First section whose title, with or without its TODO keyword, equals `title`.
    pub fn find_section<'a>(doc: &'a Document, title: &str) -> Option<&'a Section> {
        sections(doc).find(|s| s.title.as_deref() == Some(title) || s.headline() == Some(title))
    }

    /// Indented headline outline, one section per line.
    pub fn outline(doc: &Document) -> String {
        let mut out = String::new();
        for section in sections(doc) {
            let _ = writeln!(
                out,
                "{}{} {}",
                "  ".repeat(section.level.saturating_sub(1)),
                "*".repeat(section.level),
                section.title.as_deref().unwrap_or_default()
            );
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_document_str;

        const INPUT: &str = "#+TITLE: Plan\n* TODO Alpha\ntext\n** Beta\n*** Gamma\n* DONE Delta\n";

        #[test]
        fn walks_sections_in_document_order() {
            let doc = parse_document_str(INPUT).expect("parse");
            let titles: Vec<_> = sections(&doc)
                .map(|s| (s.level, s.title.as_deref().unwrap_or_default()))
                .collect();
            assert_eq!(
                titles,
                vec![
                    (1, "TODO Alpha"),
                    (2, "Beta"),
                    (3, "Gamma"),
                    (1, "DONE Delta")
                ]
            );
        }

        #[test]
        fn finds_by_headline() {
            let doc = parse_document_str(INPUT).expect("parse");
            let delta = find_section(&doc, "Delta").expect("delta");
            assert!(delta.keyword().is_some_and(|k| k.is_done));
            assert!(find_section(&doc, "Gamma").is_some());
            assert!(find_section(&doc, "Missing").is_none());
        }

        #[test]
        fn renders_outline() {
            let doc = parse_document_str(INPUT).expect("parse");
            assert_eq!(
                outline(&doc),
                "* TODO Alpha\n  ** Beta\n    *** Gamma\n* DONE Delta\n"
            );
        }
    }
}

pub mod storage {
    use crate::core::Document;
    use crate::parser::{ParseOptions, Parser};
    use anyhow::{Context, Result};
    use indexmap::IndexSet;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    /// Loads and parses a document from somewhere.
    pub trait OrgLoader {
        fn load(&self, path: &Path) -> Result<Document>;

        /// Loads every document, stopping at the first failure.
        fn load_all(&self, paths: &[PathBuf]) -> Result<Vec<(PathBuf, Document)>> {
            paths
                .iter()
                .map(|path| -> Result<(PathBuf, Document)> { Ok((path.clone(), self.load(path)?)) })
                .collect()
        }
    }

    fn is_org_file(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "org")
    }

    /// Resolves files and directories into the `.org` documents they name.
    ///
    /// Explicit file inputs must be `.org` files; directories are walked recursively,
    /// skipping symlinks and non-Org files. Paths are canonical, deduplicated, and each
    /// directory's documents come out sorted.
    pub fn discover(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut found: IndexSet<PathBuf> = IndexSet::new();
        for input in inputs {
            let root = fs::canonicalize(input)
                .with_context(|| format!("resolving path {:?}", input))?;
            if root.is_file() {
                if !is_org_file(&root) {
                    anyhow::bail!("{:?} is not an .org file", root);
                }
                found.insert(root);
                continue;
            }

            log::debug!("Scanning directory {:?}", root);
            let mut documents = Vec::new();
            let mut pending = vec![root];
            while let Some(dir) = pending.pop() {
                let entries =
                    fs::read_dir(&dir).with_context(|| format!("listing {:?}", dir))?;
                for entry in entries {
                    let entry = entry?;
                    let kind = entry.file_type()?;
                    if kind.is_dir() {
                        pending.push(entry.path());
                    } else if kind.is_file() && is_org_file(&entry.path()) {
                        log::trace!("Found org file {:?}", entry.path());
                        documents.push(entry.path());
                    }
                }
            }
            documents.sort();
            found.extend(documents);
        }
        Ok(found.into_iter().collect())
    }

    /// Reads documents from the local filesystem.
    #[derive(Debug, Clone, Default)]
    pub struct FsLoader {
        pub options: ParseOptions,
    }

    impl FsLoader {
        pub fn new(options: ParseOptions) -> Self {
            Self { options }
        }
    }

    impl OrgLoader for FsLoader {
        fn load(&self, path: &Path) -> Result<Document> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Parser::from_content(&text)
                .with_options(self.options.clone())
                .parse()
                .with_context(|| format!("parsing {:?}", path))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;

        #[test]
        fn loads_from_disk() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("notes.org");
            fs::write(&path, "#+TITLE: Notes\n* Heading\n").expect("write");

            let doc = FsLoader::default().load(&path).expect("load");
            assert_eq!(doc.title(), Some("Notes"));
            assert_eq!(doc.children().len(), 1);
        }

        #[test]
        fn reports_parse_errors_with_path() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("broken.org");
            fs::write(&path, "#+begin_src\n").expect("write");

            let err = FsLoader::default().load(&path).unwrap_err();
            let chain = format!("{err:#}");
            assert!(chain.contains("broken.org"), "{chain}");
            assert!(chain.contains("no BlockEnd"), "{chain}");
        }

        #[test]
        fn discover_walks_directories_and_skips_other_files() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            let nested = root.join("notes/2025");
            fs::create_dir_all(&nested).expect("mkdir nested");
            fs::write(root.join("a.org"), "* A").expect("write a");
            fs::write(nested.join("b.org"), "* B").expect("write b");
            fs::write(nested.join("readme.txt"), "skip").expect("write txt");

            let found = discover(&[root.to_path_buf()]).expect("discover");
            let names: Vec<_> = found
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
                .collect();
            assert_eq!(names, vec!["a.org", "b.org"]);
        }

        #[test]
        fn discover_deduplicates_and_rejects_foreign_files() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let file = tmp.path().join("a.org");
            fs::write(&file, "* A").expect("write a");
            let found = discover(&[file.clone(), tmp.path().to_path_buf()]).expect("discover");
            assert_eq!(found.len(), 1);

            let markdown = tmp.path().join("notes.md");
            fs::write(&markdown, "# md").expect("write md");
            assert!(discover(&[markdown]).is_err());
        }

        #[test]
        fn load_all_parses_every_discovered_document() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(tmp.path().join("one.org"), "#+TITLE: One\n* H\n").expect("write");
            fs::write(tmp.path().join("two.org"), "text\n").expect("write");

            let paths = discover(&[tmp.path().to_path_buf()]).expect("discover");
            let parsed = FsLoader::default().load_all(&paths).expect("load");
            assert_eq!(parsed.len(), 2);
            assert_eq!(parsed[0].1.title(), Some("One"));
        }

        #[test]
        fn missing_file_is_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            assert!(FsLoader::default().load(&tmp.path().join("nope.org")).is_err());
        }
    }
}

pub use crate::core::{Document, DocumentMeta, Node, Section};
pub use crate::parser::{ParseError, ParseOptions, ParseResult, Parser, parse_document_str};
pub use crate::query::{find_section, outline, sections};
pub use crate::tokens::{Token, TokenMeta, TokenWithMeta, tokenize, tokenize_str};
