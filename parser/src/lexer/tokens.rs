#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Token<'a> {
    Eof,
    Identifier(&'a str),
    Scalar(&'a str),
    Indent(usize),

    OpenBracket,
    CloseBracket,
    OpenBrace,
    CloseBrace,

    Colon,
    Comma,
    Dash,
    Hash,
    NewLine,
}
