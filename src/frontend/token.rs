//! Tokens and source locations

use std::fmt;

/// A position in the user source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

impl SourceLoc {
    pub fn new(line: u32, col: u32) -> Self {
        SourceLoc { line, col }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A lexed token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    IntLit(u64),
    FloatLit { value: f64, is_f32: bool },
    StrLit(String),
    CharLit(u8),

    // Punctuation
    ColonColon,
    Semi,
    Comma,
    Dot,
    Arrow,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Not,
    AmpAmp,
    PipePipe,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    Shl,
    Shr,
    ShlAssign,
    ShrAssign,
    PlusPlus,
    MinusMinus,
    Colon,
    Question,

    // Keywords
    KwNamespace,
    KwStruct,
    KwClass,
    KwPublic,
    KwPrivate,
    KwProtected,
    KwVirtual,
    KwStatic,
    KwConst,
    KwConstexpr,
    KwTemplate,
    KwTypename,
    KwUsing,
    KwReturn,
    KwIf,
    KwElse,
    KwWhile,
    KwFor,
    KwBreak,
    KwContinue,
    KwBool,
    KwVoid,
    KwChar,
    KwInt,
    KwLong,
    KwShort,
    KwUnsigned,
    KwSigned,
    KwFloat,
    KwDouble,
    KwThis,
    KwTrue,
    KwFalse,
    KwNullptr,
    KwThreadLocal,
    KwNew,
    KwDelete,
    KwDefault,
    KwTry,
    KwThrow,
    KwOperator,
}

impl Token {
    /// Map an identifier to its keyword token, if it is one
    pub fn keyword(ident: &str) -> Option<Token> {
        let token = match ident {
            "namespace" => Token::KwNamespace,
            "struct" => Token::KwStruct,
            "class" => Token::KwClass,
            "public" => Token::KwPublic,
            "private" => Token::KwPrivate,
            "protected" => Token::KwProtected,
            "virtual" => Token::KwVirtual,
            "static" => Token::KwStatic,
            "const" => Token::KwConst,
            "constexpr" => Token::KwConstexpr,
            "template" => Token::KwTemplate,
            "typename" => Token::KwTypename,
            "using" => Token::KwUsing,
            "return" => Token::KwReturn,
            "if" => Token::KwIf,
            "else" => Token::KwElse,
            "while" => Token::KwWhile,
            "for" => Token::KwFor,
            "break" => Token::KwBreak,
            "continue" => Token::KwContinue,
            "bool" => Token::KwBool,
            "void" => Token::KwVoid,
            "char" => Token::KwChar,
            "int" => Token::KwInt,
            "long" => Token::KwLong,
            "short" => Token::KwShort,
            "unsigned" => Token::KwUnsigned,
            "signed" => Token::KwSigned,
            "float" => Token::KwFloat,
            "double" => Token::KwDouble,
            "this" => Token::KwThis,
            "true" => Token::KwTrue,
            "false" => Token::KwFalse,
            "nullptr" => Token::KwNullptr,
            "thread_local" => Token::KwThreadLocal,
            "new" => Token::KwNew,
            "delete" => Token::KwDelete,
            "default" => Token::KwDefault,
            "try" => Token::KwTry,
            "throw" => Token::KwThrow,
            "operator" => Token::KwOperator,
            _ => return None,
        };
        Some(token)
    }
}

/// A token together with the location it starts at
#[derive(Debug, Clone, PartialEq)]
pub struct TokenWithLoc {
    pub token: Token,
    pub loc: SourceLoc,
}
