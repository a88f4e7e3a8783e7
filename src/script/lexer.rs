use super::ScriptError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Let,
    If,
    Else,
    Return,
    True,
    False,
    Null,
    Undefined,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Nullish,
    Question,
    Colon,
    Dot,
    Comma,
    Semicolon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

/// Token together with its byte offset in the source
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ScriptError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // line comments
        if c == '/' && matches!(chars.get(i + 1), Some((_, '/'))) {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && matches!(chars.get(i + 1), Some((_, d)) if d.is_ascii_digit()))
        {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let number = text.parse::<f64>().map_err(|_| ScriptError::Syntax {
                offset,
                message: format!("invalid number literal '{}'", text),
            })?;
            tokens.push(Spanned {
                token: Token::Number(number),
                offset,
            });
            continue;
        }

        if c == '"' || c == '\'' {
            let (text, next) = read_string(&chars, i)?;
            tokens.push(Spanned {
                token: Token::Str(text),
                offset,
            });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let token = match word.as_str() {
                "let" | "var" | "const" => Token::Let,
                "if" => Token::If,
                "else" => Token::Else,
                "return" => Token::Return,
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "undefined" => Token::Undefined,
                _ => Token::Ident(word),
            };
            tokens.push(Spanned { token, offset });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let after = chars.get(i + 2).map(|(_, c)| *c);
        let (token, width) = match (c, next, after) {
            ('=', Some('='), Some('=')) => (Token::StrictEq, 3),
            ('!', Some('='), Some('=')) => (Token::StrictNotEq, 3),
            ('=', Some('='), _) => (Token::Eq, 2),
            ('!', Some('='), _) => (Token::NotEq, 2),
            ('<', Some('='), _) => (Token::LtEq, 2),
            ('>', Some('='), _) => (Token::GtEq, 2),
            ('&', Some('&'), _) => (Token::And, 2),
            ('|', Some('|'), _) => (Token::Or, 2),
            ('?', Some('?'), _) => (Token::Nullish, 2),
            ('=', _, _) => (Token::Assign, 1),
            ('!', _, _) => (Token::Bang, 1),
            ('<', _, _) => (Token::Lt, 1),
            ('>', _, _) => (Token::Gt, 1),
            ('+', _, _) => (Token::Plus, 1),
            ('-', _, _) => (Token::Minus, 1),
            ('*', _, _) => (Token::Star, 1),
            ('/', _, _) => (Token::Slash, 1),
            ('%', _, _) => (Token::Percent, 1),
            ('?', _, _) => (Token::Question, 1),
            (':', _, _) => (Token::Colon, 1),
            ('.', _, _) => (Token::Dot, 1),
            (',', _, _) => (Token::Comma, 1),
            (';', _, _) => (Token::Semicolon, 1),
            ('(', _, _) => (Token::LParen, 1),
            (')', _, _) => (Token::RParen, 1),
            ('[', _, _) => (Token::LBracket, 1),
            (']', _, _) => (Token::RBracket, 1),
            ('{', _, _) => (Token::LBrace, 1),
            ('}', _, _) => (Token::RBrace, 1),
            _ => {
                return Err(ScriptError::Syntax {
                    offset,
                    message: format!("unexpected character '{}'", c),
                })
            }
        };
        tokens.push(Spanned { token, offset });
        i += width;
    }

    Ok(tokens)
}

fn read_string(chars: &[(usize, char)], start: usize) -> Result<(String, usize), ScriptError> {
    let (offset, quote) = chars[start];
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((text, i + 1));
        }
        if c == '\\' {
            i += 1;
            let escaped = chars.get(i).map(|(_, c)| *c).ok_or(ScriptError::Syntax {
                offset,
                message: "unterminated escape sequence".to_string(),
            })?;
            text.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
        } else {
            text.push(c);
        }
        i += 1;
    }

    Err(ScriptError::Syntax {
        offset,
        message: "unterminated string literal".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn tokenizes_operators_greedily() {
        assert_eq!(
            kinds("a === b !== c == d ?? e"),
            vec![
                Token::Ident("a".into()),
                Token::StrictEq,
                Token::Ident("b".into()),
                Token::StrictNotEq,
                Token::Ident("c".into()),
                Token::Eq,
                Token::Ident("d".into()),
                Token::Nullish,
                Token::Ident("e".into()),
            ]
        );
    }

    #[test]
    fn reads_strings_with_escapes_and_comments() {
        assert_eq!(
            kinds("return 'it\\'s'; // done"),
            vec![Token::Return, Token::Str("it's".into()), Token::Semicolon]
        );
    }

    #[test]
    fn reports_offset_of_bad_character() {
        match tokenize("message # 1") {
            Err(ScriptError::Syntax { offset, .. }) => assert_eq!(offset, 8),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
