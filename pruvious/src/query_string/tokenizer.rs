//! Lexing for the `where` grammar.
//!
//! The scan keeps backslash escapes in literal text; [`split_unescaped`] and
//! [`unescape`] resolve them once the surrounding structure is known.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    Open,
    Close,
}

/// Literal text or a bracketed group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenTree {
    Literal(String),
    Group(Vec<TokenTree>),
}

/// Split input into literals and unescaped brackets.
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                literal.push('\\');
                if let Some(next) = chars.next() {
                    literal.push(next);
                }
            }
            '[' | ']' => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(if c == '[' { Token::Open } else { Token::Close });
            }
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

/// Fold bracket tokens into groups. The flag is false when brackets were
/// unbalanced; unterminated groups are closed at the end of input and stray
/// closing brackets are dropped.
pub fn build_tree(tokens: Vec<Token>) -> (Vec<TokenTree>, bool) {
    let mut stack: Vec<Vec<TokenTree>> = vec![Vec::new()];
    let mut balanced = true;

    for token in tokens {
        match token {
            Token::Literal(text) => {
                if let Some(top) = stack.last_mut() {
                    top.push(TokenTree::Literal(text));
                }
            }
            Token::Open => stack.push(Vec::new()),
            Token::Close => {
                if stack.len() > 1 {
                    if let Some(group) = stack.pop() {
                        if let Some(top) = stack.last_mut() {
                            top.push(TokenTree::Group(group));
                        }
                    }
                } else {
                    balanced = false;
                }
            }
        }
    }

    while stack.len() > 1 {
        balanced = false;
        if let Some(group) = stack.pop() {
            if let Some(top) = stack.last_mut() {
                top.push(TokenTree::Group(group));
            }
        }
    }
    (stack.pop().unwrap_or_default(), balanced)
}

/// Split on unescaped `separator`, resolving escapes in every piece.
pub fn split_unescaped(text: &str, separator: char) -> Vec<String> {
    split_raw(text, separator).iter().map(|piece| unescape(piece)).collect()
}

/// Split on unescaped `separator`, keeping escapes in every piece.
pub fn split_raw(text: &str, separator: char) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == separator {
            pieces.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    pieces.push(current);
    pieces
}

pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape the characters that carry meaning in the grammar.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '[' | ']' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lit(s: &str) -> TokenTree {
        TokenTree::Literal(s.into())
    }

    #[test]
    fn test_tokenize_honors_escapes() {
        assert_eq!(
            tokenize(r"a[=][x\]y],b"),
            vec![
                Token::Literal("a".into()),
                Token::Open,
                Token::Literal("=".into()),
                Token::Close,
                Token::Open,
                Token::Literal(r"x\]y".into()),
                Token::Close,
                Token::Literal(",b".into()),
            ]
        );
    }

    #[test]
    fn test_tree_nesting() {
        let (tree, balanced) = build_tree(tokenize("some:[a[=][1],b[=][2]]"));
        assert!(balanced);
        assert_eq!(
            tree,
            vec![
                lit("some:"),
                TokenTree::Group(vec![
                    lit("a"),
                    TokenTree::Group(vec![lit("=")]),
                    TokenTree::Group(vec![lit("1")]),
                    lit(",b"),
                    TokenTree::Group(vec![lit("=")]),
                    TokenTree::Group(vec![lit("2")]),
                ]),
            ]
        );
    }

    #[test]
    fn test_unbalanced_brackets() {
        let (tree, balanced) = build_tree(tokenize("a[=][1"));
        assert!(!balanced);
        assert_eq!(tree.len(), 3);
        let (_, balanced) = build_tree(tokenize("a]"));
        assert!(!balanced);
    }

    #[test]
    fn test_split_and_escape() {
        assert_eq!(split_unescaped(r"a\,b,c", ','), vec!["a,b", "c"]);
        assert_eq!(split_raw(r"a\,b,\null", ','), vec![r"a\,b", r"\null"]);
        assert_eq!(unescape(&escape(r"x[1],\y")), r"x[1],\y");
    }
}
