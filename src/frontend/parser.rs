//! Recursive-descent parser for the UDO source subset
//!
//! The grammar is the declaration-level slice of C++ a UDO can contain. The
//! few genuinely ambiguous spots (declaration vs. expression statements,
//! `emit<T>(...)` vs. a less-than comparison) are resolved by bounded
//! backtracking on the token index.

use crate::error::{UdoError, UdoResult};

use super::ast::*;
use super::lexer::Lexer;
use super::token::{SourceLoc, Token, TokenWithLoc};

/// Parse a full compilation unit
pub fn parse(source: &str) -> UdoResult<TranslationUnit> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let decls = parser.parse_decls(None)?;
    Ok(TranslationUnit { decls })
}

/// Well-known typedef names that lower directly to primitive types
fn builtin_typedef(name: &str) -> Option<PrimType> {
    let prim = match name {
        "int8_t" => PrimType::I8,
        "uint8_t" => PrimType::U8,
        "int16_t" => PrimType::I16,
        "uint16_t" => PrimType::U16,
        "int32_t" => PrimType::I32,
        "uint32_t" => PrimType::U32,
        "int64_t" => PrimType::I64,
        "uint64_t" => PrimType::U64,
        "size_t" => PrimType::U64,
        "uintptr_t" => PrimType::U64,
        "intptr_t" => PrimType::I64,
        _ => return None,
    };
    Some(prim)
}

struct Parser {
    tokens: Vec<TokenWithLoc>,
    pos: usize,
}

impl Parser {
    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|t| &t.token)
    }

    fn loc(&self) -> SourceLoc {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.loc)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.current() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, context: &str) -> UdoResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?} in {}", token, context)))
        }
    }

    fn expect_ident(&mut self, context: &str) -> UdoResult<String> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("expected identifier in {}", context)))
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> UdoError {
        UdoError::invalid_user_code(format!("{} at {}", message.into(), self.loc()))
    }

    // === Declarations ===

    fn parse_decls(&mut self, end: Option<&Token>) -> UdoResult<Vec<Decl>> {
        let mut decls = Vec::new();
        loop {
            match self.current() {
                None => {
                    if end.is_some() {
                        return Err(self.error("unexpected end of input"));
                    }
                    break;
                }
                Some(token) if Some(token) == end => break,
                _ => {
                    if let Some(decl) = self.parse_decl()? {
                        decls.push(decl);
                    }
                }
            }
        }
        Ok(decls)
    }

    fn parse_decl(&mut self) -> UdoResult<Option<Decl>> {
        let loc = self.loc();
        match self.current() {
            Some(Token::KwNamespace) => {
                self.advance();
                let name = self.expect_ident("namespace declaration")?;
                self.expect(&Token::LBrace, "namespace declaration")?;
                let decls = self.parse_decls(Some(&Token::RBrace))?;
                self.expect(&Token::RBrace, "namespace declaration")?;
                Ok(Some(Decl::Namespace(NamespaceDecl { name, decls, loc })))
            }
            Some(Token::KwStruct) | Some(Token::KwClass) => {
                let is_class = self.current() == Some(&Token::KwClass);
                self.advance();
                let name = self.expect_ident("record declaration")?;
                if self.eat(&Token::Semi) {
                    // Forward declaration, nothing to record
                    return Ok(None);
                }
                let record = self.parse_record_definition(name, is_class, loc)?;
                Ok(Some(Decl::Record(record)))
            }
            Some(Token::KwUsing) => {
                // `using` directives carry no information for the analysis
                while let Some(token) = self.advance() {
                    if token == Token::Semi {
                        break;
                    }
                }
                Ok(None)
            }
            Some(Token::KwThreadLocal) => {
                Err(self.error("thread_local variables are not supported in UDOs"))
            }
            Some(Token::KwTemplate) => {
                Err(self.error("templates are not supported in UDOs"))
            }
            _ => self.parse_global_or_function(loc).map(Some),
        }
    }

    fn parse_global_or_function(&mut self, loc: SourceLoc) -> UdoResult<Decl> {
        let mut is_static = false;
        let mut is_const = false;
        loop {
            match self.current() {
                Some(Token::KwStatic) => {
                    is_static = true;
                    self.advance();
                }
                Some(Token::KwConstexpr) => {
                    is_const = true;
                    self.advance();
                }
                _ => break,
            }
        }

        let ty = self.parse_type()?;
        let is_const = is_const || matches!(ty, TypeRef::Const(_));
        let name = self.expect_ident("declaration")?;

        if self.eat(&Token::LParen) {
            let params = self.parse_params()?;
            let body = if self.eat(&Token::Semi) {
                None
            } else {
                Some(self.parse_block()?)
            };
            return Ok(Decl::Function(FunctionDecl {
                name,
                ret: ty,
                params,
                body,
                is_static,
                loc,
            }));
        }

        let init = if self.eat(&Token::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(&Token::Semi, "global variable declaration")?;
        Ok(Decl::Global(GlobalDecl {
            name,
            ty,
            init,
            is_static,
            is_const,
            loc,
        }))
    }

    fn parse_record_definition(
        &mut self,
        name: String,
        is_class: bool,
        loc: SourceLoc,
    ) -> UdoResult<RecordDecl> {
        let mut bases = Vec::new();
        if self.eat(&Token::Colon) {
            loop {
                let base_loc = self.loc();
                let mut access = if is_class { Access::Private } else { Access::Public };
                let mut is_virtual = false;
                loop {
                    match self.current() {
                        Some(Token::KwPublic) => {
                            access = Access::Public;
                            self.advance();
                        }
                        Some(Token::KwProtected) => {
                            access = Access::Protected;
                            self.advance();
                        }
                        Some(Token::KwPrivate) => {
                            access = Access::Private;
                            self.advance();
                        }
                        Some(Token::KwVirtual) => {
                            is_virtual = true;
                            self.advance();
                        }
                        _ => break,
                    }
                }
                let base_name = self.parse_qual_name()?;
                bases.push(BaseSpecifier {
                    access,
                    is_virtual,
                    name: base_name,
                    loc: base_loc,
                });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        self.expect(&Token::LBrace, "record definition")?;
        let members = self.parse_members(&name, is_class)?;
        self.expect(&Token::RBrace, "record definition")?;
        self.expect(&Token::Semi, "record definition")?;

        Ok(RecordDecl {
            name,
            is_class,
            bases,
            members,
            loc,
        })
    }

    fn parse_members(&mut self, record_name: &str, is_class: bool) -> UdoResult<Vec<Member>> {
        let mut members = Vec::new();
        let mut access = if is_class { Access::Private } else { Access::Public };

        loop {
            let loc = self.loc();
            match self.current() {
                Some(Token::RBrace) | None => break,
                Some(Token::KwPublic) => {
                    self.advance();
                    self.expect(&Token::Colon, "access specifier")?;
                    access = Access::Public;
                }
                Some(Token::KwProtected) => {
                    self.advance();
                    self.expect(&Token::Colon, "access specifier")?;
                    access = Access::Protected;
                }
                Some(Token::KwPrivate) => {
                    self.advance();
                    self.expect(&Token::Colon, "access specifier")?;
                    access = Access::Private;
                }
                Some(Token::KwStruct) | Some(Token::KwClass) => {
                    let nested_is_class = self.current() == Some(&Token::KwClass);
                    self.advance();
                    let name = self.expect_ident("nested record")?;
                    if self.eat(&Token::Semi) {
                        continue;
                    }
                    let record = self.parse_record_definition(name, nested_is_class, loc)?;
                    members.push(Member::Record(record));
                }
                Some(Token::KwUsing) => {
                    while let Some(token) = self.advance() {
                        if token == Token::Semi {
                            break;
                        }
                    }
                }
                Some(Token::KwTemplate) => {
                    let method = self.parse_template_method(access, loc)?;
                    members.push(Member::Method(method));
                }
                Some(Token::Tilde) => {
                    let dtor = self.parse_destructor(record_name, false, access, loc)?;
                    members.push(Member::Destructor(dtor));
                }
                Some(Token::KwVirtual) => {
                    self.advance();
                    if self.current() == Some(&Token::Tilde) {
                        let dtor = self.parse_destructor(record_name, true, access, loc)?;
                        members.push(Member::Destructor(dtor));
                    } else {
                        let mut method = self.parse_method_or_field(record_name, access, loc)?;
                        match &mut method {
                            Member::Method(m) => m.is_virtual = true,
                            _ => return Err(self.error("virtual applies only to member functions")),
                        }
                        members.push(method);
                    }
                }
                Some(Token::Ident(name))
                    if name == record_name && self.peek(1) == Some(&Token::LParen) =>
                {
                    let ctor = self.parse_constructor(access, loc)?;
                    members.push(Member::Constructor(ctor));
                }
                Some(Token::KwThreadLocal) => {
                    return Err(self.error("thread_local members are not supported in UDOs"));
                }
                Some(Token::KwOperator) => {
                    return Err(self.error("operator overloading is not supported in UDOs"));
                }
                _ => {
                    let member = self.parse_method_or_field(record_name, access, loc)?;
                    members.push(member);
                }
            }
        }

        Ok(members)
    }

    fn parse_template_method(&mut self, access: Access, loc: SourceLoc) -> UdoResult<MethodDecl> {
        self.expect(&Token::KwTemplate, "template declaration")?;
        self.expect(&Token::Lt, "template declaration")?;
        self.expect(&Token::KwTypename, "template declaration")?;
        let param = self.expect_ident("template parameter")?;
        self.expect(&Token::Gt, "template declaration")?;

        let is_static = self.eat(&Token::KwStatic);
        let ret = self.parse_type()?;
        let name = self.expect_ident("template method")?;
        self.expect(&Token::LParen, "template method")?;
        let params = self.parse_params()?;
        self.expect(&Token::Semi, "template method declaration")?;

        Ok(MethodDecl {
            name,
            ret,
            params,
            body: None,
            is_static,
            is_const: false,
            is_virtual: false,
            template_param: Some(param),
            access,
            loc,
        })
    }

    fn parse_destructor(
        &mut self,
        record_name: &str,
        is_virtual: bool,
        access: Access,
        loc: SourceLoc,
    ) -> UdoResult<DtorDecl> {
        self.expect(&Token::Tilde, "destructor")?;
        let name = self.expect_ident("destructor")?;
        if name != record_name {
            return Err(self.error("destructor name does not match its class"));
        }
        self.expect(&Token::LParen, "destructor")?;
        self.expect(&Token::RParen, "destructor")?;

        let mut is_defaulted = false;
        let body = if self.eat(&Token::Assign) {
            match self.advance() {
                Some(Token::KwDefault) => is_defaulted = true,
                _ => return Err(self.error("expected 'default' after '=' in destructor")),
            }
            self.expect(&Token::Semi, "destructor")?;
            None
        } else if self.eat(&Token::Semi) {
            None
        } else {
            Some(self.parse_block()?)
        };

        Ok(DtorDecl {
            body,
            is_virtual,
            is_defaulted,
            access,
            loc,
        })
    }

    fn parse_constructor(&mut self, access: Access, loc: SourceLoc) -> UdoResult<CtorDecl> {
        self.advance(); // class name
        self.expect(&Token::LParen, "constructor")?;
        let params = self.parse_params()?;

        let mut inits = Vec::new();
        if self.eat(&Token::Colon) {
            loop {
                let init_loc = self.loc();
                let member = self.expect_ident("member initializer")?;
                let args = if self.eat(&Token::LParen) {
                    self.parse_call_args(&Token::RParen)?
                } else if self.eat(&Token::LBrace) {
                    self.parse_call_args(&Token::RBrace)?
                } else {
                    return Err(self.error("expected '(' or '{' in member initializer"));
                };
                inits.push(MemberInit {
                    member,
                    args,
                    loc: init_loc,
                });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        let mut is_defaulted = false;
        let mut is_deleted = false;
        let body = if self.eat(&Token::Assign) {
            match self.advance() {
                Some(Token::KwDefault) => is_defaulted = true,
                Some(Token::KwDelete) => is_deleted = true,
                _ => return Err(self.error("expected 'default' or 'delete' after '='")),
            }
            self.expect(&Token::Semi, "constructor")?;
            None
        } else if self.eat(&Token::Semi) {
            None
        } else {
            Some(self.parse_block()?)
        };

        Ok(CtorDecl {
            params,
            inits,
            body,
            is_defaulted,
            is_deleted,
            access,
            loc,
        })
    }

    fn parse_method_or_field(
        &mut self,
        _record_name: &str,
        access: Access,
        loc: SourceLoc,
    ) -> UdoResult<Member> {
        let is_static = self.eat(&Token::KwStatic);
        let ty = self.parse_type()?;
        let name = self.expect_ident("member declaration")?;

        if self.eat(&Token::LParen) {
            let params = self.parse_params()?;
            let is_const = self.eat(&Token::KwConst);

            let body = if self.eat(&Token::Semi) {
                None
            } else {
                Some(self.parse_block()?)
            };

            return Ok(Member::Method(MethodDecl {
                name,
                ret: ty,
                params,
                body,
                is_static,
                is_const,
                is_virtual: false,
                template_param: None,
                access,
                loc,
            }));
        }

        // Field
        let init = if self.eat(&Token::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        if self.current() == Some(&Token::Comma) {
            return Err(self.error("declare one field per statement"));
        }
        self.expect(&Token::Semi, "field declaration")?;

        Ok(Member::Field(FieldDecl {
            name,
            ty,
            init,
            is_static,
            access,
            loc,
        }))
    }

    fn parse_params(&mut self) -> UdoResult<Vec<Param>> {
        let mut params = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(params);
        }
        loop {
            let loc = self.loc();
            let ty = self.parse_type()?;
            let name = match self.current() {
                Some(Token::Ident(_)) => Some(self.expect_ident("parameter")?),
                _ => None,
            };
            params.push(Param { name, ty, loc });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen, "parameter list")?;
        Ok(params)
    }

    // === Types ===

    fn is_type_start(&self) -> bool {
        matches!(
            self.current(),
            Some(Token::KwConst)
                | Some(Token::KwBool)
                | Some(Token::KwVoid)
                | Some(Token::KwChar)
                | Some(Token::KwInt)
                | Some(Token::KwLong)
                | Some(Token::KwShort)
                | Some(Token::KwUnsigned)
                | Some(Token::KwSigned)
                | Some(Token::KwFloat)
                | Some(Token::KwDouble)
                | Some(Token::KwTypename)
        )
    }

    fn parse_type(&mut self) -> UdoResult<TypeRef> {
        let is_const = self.eat(&Token::KwConst);

        let mut ty = self.parse_core_type()?;

        if is_const {
            ty = TypeRef::Const(Box::new(ty));
        }

        loop {
            match self.current() {
                Some(Token::Star) => {
                    self.advance();
                    ty = TypeRef::Ptr(Box::new(ty));
                }
                Some(Token::Amp) => {
                    self.advance();
                    ty = TypeRef::Ref(Box::new(ty));
                }
                Some(Token::AmpAmp) => {
                    self.advance();
                    ty = TypeRef::RvalueRef(Box::new(ty));
                }
                Some(Token::KwConst) => {
                    self.advance();
                    ty = TypeRef::Const(Box::new(ty));
                }
                _ => break,
            }
        }
        Ok(ty)
    }

    fn parse_core_type(&mut self) -> UdoResult<TypeRef> {
        // `typename T::Member`
        if self.eat(&Token::KwTypename) {
            let param = self.expect_ident("dependent type")?;
            self.expect(&Token::ColonColon, "dependent type")?;
            let member = self.expect_ident("dependent type")?;
            return Ok(TypeRef::Dependent { param, member });
        }

        // Combinations of the fundamental type keywords
        let mut signed = None;
        let mut longs = 0u32;
        let mut short = false;
        let mut base: Option<PrimType> = None;
        let mut saw_keyword = false;
        loop {
            match self.current() {
                Some(Token::KwUnsigned) => {
                    signed = Some(false);
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwSigned) => {
                    signed = Some(true);
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwLong) => {
                    longs += 1;
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwShort) => {
                    short = true;
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwInt) => {
                    base = Some(PrimType::I32);
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwChar) => {
                    base = Some(PrimType::Char);
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwBool) => {
                    base = Some(PrimType::Bool);
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwVoid) => {
                    base = Some(PrimType::Void);
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwFloat) => {
                    base = Some(PrimType::F32);
                    saw_keyword = true;
                    self.advance();
                }
                Some(Token::KwDouble) => {
                    base = Some(PrimType::F64);
                    saw_keyword = true;
                    self.advance();
                }
                _ => break,
            }
        }

        if saw_keyword {
            let prim = match (base, signed, short, longs) {
                (Some(PrimType::F64), _, _, 1) => PrimType::LongDouble,
                (Some(PrimType::F64), _, _, 0) => PrimType::F64,
                (Some(PrimType::F32), _, _, 0) => PrimType::F32,
                (Some(PrimType::Bool), _, _, 0) => PrimType::Bool,
                (Some(PrimType::Void), _, _, 0) => PrimType::Void,
                (Some(PrimType::Char), Some(true), _, 0) => PrimType::I8,
                (Some(PrimType::Char), Some(false), _, 0) => PrimType::U8,
                (Some(PrimType::Char), None, _, 0) => PrimType::Char,
                (_, s, true, 0) => {
                    if s == Some(false) {
                        PrimType::U16
                    } else {
                        PrimType::I16
                    }
                }
                (_, s, false, 0) => {
                    if s == Some(false) {
                        PrimType::U32
                    } else {
                        PrimType::I32
                    }
                }
                (_, s, false, 1) | (_, s, false, 2) => {
                    if s == Some(false) {
                        PrimType::U64
                    } else {
                        PrimType::I64
                    }
                }
                _ => return Err(self.error("invalid fundamental type")),
            };
            return Ok(TypeRef::Prim(prim));
        }

        let name = self.parse_qual_name()?;
        if name.len() == 1 {
            if let Some(prim) = builtin_typedef(&name[0]) {
                return Ok(TypeRef::Prim(prim));
            }
        }
        Ok(TypeRef::Named(name))
    }

    fn parse_qual_name(&mut self) -> UdoResult<QualName> {
        let mut name = vec![self.expect_ident("qualified name")?];
        while self.current() == Some(&Token::ColonColon) {
            self.advance();
            name.push(self.expect_ident("qualified name")?);
        }
        Ok(name)
    }

    // === Statements ===

    fn parse_block(&mut self) -> UdoResult<Block> {
        self.expect(&Token::LBrace, "block")?;
        let mut stmts = Vec::new();
        while self.current() != Some(&Token::RBrace) {
            if self.current().is_none() {
                return Err(self.error("unexpected end of input in block"));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect(&Token::RBrace, "block")?;
        Ok(Block { stmts })
    }

    fn parse_stmt(&mut self) -> UdoResult<Stmt> {
        let loc = self.loc();
        match self.current() {
            Some(Token::LBrace) => Ok(Stmt::Compound(self.parse_block()?)),
            Some(Token::KwReturn) => {
                self.advance();
                let value = if self.current() == Some(&Token::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Token::Semi, "return statement")?;
                Ok(Stmt::Return { value, loc })
            }
            Some(Token::KwIf) => {
                self.advance();
                self.expect(&Token::LParen, "if statement")?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen, "if statement")?;
                let then_branch = Box::new(self.parse_stmt()?);
                let else_branch = if self.eat(&Token::KwElse) {
                    Some(Box::new(self.parse_stmt()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                })
            }
            Some(Token::KwWhile) => {
                self.advance();
                self.expect(&Token::LParen, "while statement")?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen, "while statement")?;
                let body = Box::new(self.parse_stmt()?);
                Ok(Stmt::While { cond, body })
            }
            Some(Token::KwFor) => {
                self.advance();
                self.expect(&Token::LParen, "for statement")?;
                let init = if self.eat(&Token::Semi) {
                    None
                } else {
                    Some(Box::new(self.parse_stmt()?))
                };
                let cond = if self.current() == Some(&Token::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Token::Semi, "for statement")?;
                let step = if self.current() == Some(&Token::RParen) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Token::RParen, "for statement")?;
                let body = Box::new(self.parse_stmt()?);
                Ok(Stmt::For {
                    init,
                    cond,
                    step,
                    body,
                })
            }
            Some(Token::KwBreak) => {
                self.advance();
                self.expect(&Token::Semi, "break statement")?;
                Ok(Stmt::Break(loc))
            }
            Some(Token::KwContinue) => {
                self.advance();
                self.expect(&Token::Semi, "continue statement")?;
                Ok(Stmt::Continue(loc))
            }
            Some(Token::KwTry) | Some(Token::KwThrow) => {
                Err(self.error("exceptions are not supported in UDOs"))
            }
            Some(Token::KwNew) | Some(Token::KwDelete) => {
                Err(self.error("new/delete expressions are not supported in UDOs"))
            }
            Some(Token::KwThreadLocal) => {
                Err(self.error("thread_local variables are not supported in UDOs"))
            }
            _ => {
                if let Some(stmt) = self.try_parse_local_decl()? {
                    return Ok(stmt);
                }
                let expr = self.parse_expr()?;
                self.expect(&Token::Semi, "expression statement")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    /// Try to parse `Type name [= init];`; rewinds and returns None when the
    /// tokens do not form a declaration.
    fn try_parse_local_decl(&mut self) -> UdoResult<Option<Stmt>> {
        let loc = self.loc();
        let starts_with_type_keyword = self.is_type_start();
        let starts_with_ident = matches!(self.current(), Some(Token::Ident(_)));
        if !starts_with_type_keyword && !starts_with_ident {
            return Ok(None);
        }

        let saved = self.pos;
        let ty = match self.parse_type() {
            Ok(ty) => ty,
            Err(_) => {
                self.pos = saved;
                return Ok(None);
            }
        };
        let name = match self.current() {
            Some(Token::Ident(name)) => name.clone(),
            _ => {
                self.pos = saved;
                return Ok(None);
            }
        };
        match self.peek(1) {
            Some(Token::Assign) | Some(Token::Semi) => {}
            _ => {
                self.pos = saved;
                return Ok(None);
            }
        }
        self.advance(); // name

        let init = if self.eat(&Token::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(&Token::Semi, "local declaration")?;
        Ok(Some(Stmt::Local {
            name,
            ty,
            init,
            loc,
        }))
    }

    // === Expressions ===

    fn parse_expr(&mut self) -> UdoResult<Expr> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> UdoResult<Expr> {
        let lhs = self.parse_binary(0)?;
        let loc = lhs.loc;

        let op = match self.current() {
            Some(Token::Assign) => None,
            Some(Token::PlusAssign) => Some(BinaryOp::Add),
            Some(Token::MinusAssign) => Some(BinaryOp::Sub),
            Some(Token::StarAssign) => Some(BinaryOp::Mul),
            Some(Token::SlashAssign) => Some(BinaryOp::Div),
            Some(Token::PercentAssign) => Some(BinaryOp::Rem),
            Some(Token::AmpAssign) => Some(BinaryOp::BitAnd),
            Some(Token::PipeAssign) => Some(BinaryOp::BitOr),
            Some(Token::CaretAssign) => Some(BinaryOp::BitXor),
            Some(Token::ShlAssign) => Some(BinaryOp::Shl),
            Some(Token::ShrAssign) => Some(BinaryOp::Shr),
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_assign()?;
        Ok(Expr {
            kind: ExprKind::Assign {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            loc,
        })
    }

    fn binary_op(token: &Token) -> Option<(BinaryOp, u8)> {
        let entry = match token {
            Token::PipePipe => (BinaryOp::LogOr, 1),
            Token::AmpAmp => (BinaryOp::LogAnd, 2),
            Token::Pipe => (BinaryOp::BitOr, 3),
            Token::Caret => (BinaryOp::BitXor, 4),
            Token::Amp => (BinaryOp::BitAnd, 5),
            Token::EqEq => (BinaryOp::Eq, 6),
            Token::Ne => (BinaryOp::Ne, 6),
            Token::Lt => (BinaryOp::Lt, 7),
            Token::Le => (BinaryOp::Le, 7),
            Token::Gt => (BinaryOp::Gt, 7),
            Token::Ge => (BinaryOp::Ge, 7),
            Token::Shl => (BinaryOp::Shl, 8),
            Token::Shr => (BinaryOp::Shr, 8),
            Token::Plus => (BinaryOp::Add, 9),
            Token::Minus => (BinaryOp::Sub, 9),
            Token::Star => (BinaryOp::Mul, 10),
            Token::Slash => (BinaryOp::Div, 10),
            Token::Percent => (BinaryOp::Rem, 10),
            _ => return None,
        };
        Some(entry)
    }

    fn parse_binary(&mut self, min_prec: u8) -> UdoResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let Some((op, prec)) = self.current().and_then(Self::binary_op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(prec + 1)?;
            let loc = lhs.loc;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> UdoResult<Expr> {
        let loc = self.loc();
        let op = match self.current() {
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Not) => Some(UnaryOp::Not),
            Some(Token::Tilde) => Some(UnaryOp::BitNot),
            Some(Token::Star) => Some(UnaryOp::Deref),
            Some(Token::Amp) => Some(UnaryOp::AddrOf),
            Some(Token::PlusPlus) => Some(UnaryOp::PreInc),
            Some(Token::MinusMinus) => Some(UnaryOp::PreDec),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> UdoResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let loc = expr.loc;
            match self.current() {
                Some(Token::Dot) | Some(Token::Arrow) => {
                    let arrow = self.current() == Some(&Token::Arrow);
                    self.advance();
                    let member = self.expect_ident("member access")?;
                    expr = Expr {
                        kind: ExprKind::Member {
                            base: Box::new(expr),
                            member,
                            arrow,
                        },
                        loc,
                    };
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket, "subscript")?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        loc,
                    };
                }
                Some(Token::LParen) => {
                    self.advance();
                    let args = self.parse_call_args(&Token::RParen)?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        loc,
                    };
                }
                Some(Token::PlusPlus) => {
                    self.advance();
                    expr = Expr {
                        kind: ExprKind::PostIncDec {
                            increment: true,
                            operand: Box::new(expr),
                        },
                        loc,
                    };
                }
                Some(Token::MinusMinus) => {
                    self.advance();
                    expr = Expr {
                        kind: ExprKind::PostIncDec {
                            increment: false,
                            operand: Box::new(expr),
                        },
                        loc,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self, end: &Token) -> UdoResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(end) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(end, "argument list")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> UdoResult<Expr> {
        let loc = self.loc();

        // Functional casts on fundamental types: `double(x)`, `uint32_t(x)`
        if self.is_type_start() && self.current() != Some(&Token::KwConst) {
            let ty = self.parse_type()?;
            self.expect(&Token::LParen, "functional cast")?;
            let arg = self.parse_expr()?;
            self.expect(&Token::RParen, "functional cast")?;
            return Ok(Expr {
                kind: ExprKind::Cast {
                    ty,
                    arg: Box::new(arg),
                },
                loc,
            });
        }

        match self.current().cloned() {
            Some(Token::IntLit(value)) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::IntLit(value),
                    loc,
                })
            }
            Some(Token::FloatLit { value, is_f32 }) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::FloatLit { value, is_f32 },
                    loc,
                })
            }
            Some(Token::StrLit(value)) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::StrLit(value),
                    loc,
                })
            }
            Some(Token::CharLit(value)) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::CharLit(value),
                    loc,
                })
            }
            Some(Token::KwTrue) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::BoolLit(true),
                    loc,
                })
            }
            Some(Token::KwFalse) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::BoolLit(false),
                    loc,
                })
            }
            Some(Token::KwNullptr) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Nullptr,
                    loc,
                })
            }
            Some(Token::KwThis) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::This,
                    loc,
                })
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen, "parenthesized expression")?;
                Ok(expr)
            }
            Some(Token::KwNew) | Some(Token::KwDelete) => {
                Err(self.error("new/delete expressions are not supported in UDOs"))
            }
            Some(Token::KwThrow) => Err(self.error("exceptions are not supported in UDOs")),
            Some(Token::Ident(first)) => {
                // A builtin typedef used as a cast: `uint32_t(x)`
                if builtin_typedef(&first).is_some() && self.peek(1) == Some(&Token::LParen) {
                    let ty = self.parse_type()?;
                    self.expect(&Token::LParen, "functional cast")?;
                    let arg = self.parse_expr()?;
                    self.expect(&Token::RParen, "functional cast")?;
                    return Ok(Expr {
                        kind: ExprKind::Cast {
                            ty,
                            arg: Box::new(arg),
                        },
                        loc,
                    });
                }

                let name = self.parse_qual_name()?;

                // `name<Type>(args)` — explicit template-argument call
                if self.current() == Some(&Token::Lt) {
                    let saved = self.pos;
                    self.advance();
                    if let Ok(type_arg) = self.parse_type() {
                        if self.eat(&Token::Gt) && self.eat(&Token::LParen) {
                            let args = self.parse_call_args(&Token::RParen)?;
                            return Ok(Expr {
                                kind: ExprKind::TemplateCall {
                                    name,
                                    type_arg,
                                    args,
                                },
                                loc,
                            });
                        }
                    }
                    self.pos = saved;
                }

                // `Type{args}` — aggregate construction
                if self.current() == Some(&Token::LBrace) {
                    self.advance();
                    let args = self.parse_call_args(&Token::RBrace)?;
                    return Ok(Expr {
                        kind: ExprKind::AggregateInit {
                            ty: TypeRef::Named(name),
                            args,
                        },
                        loc,
                    });
                }

                let _ = first;
                Ok(Expr {
                    kind: ExprKind::Name(name),
                    loc,
                })
            }
            Some(token) => Err(self.error(format!("unexpected token {:?} in expression", token))),
            None => Err(self.error("unexpected end of input in expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_operator_class() {
        let source = r#"
            class Demo : public udo::UDOperator {
               int32_t stored = 0;

               public:
               struct InputTuple { int32_t x; };
               struct OutputTuple { int32_t y; };

               void accept(udo::ExecutionState state, const InputTuple& input) {
                  stored = input.x;
               }

               bool process(udo::ExecutionState state) {
                  emit<Demo>(state, OutputTuple{stored});
                  return true;
               }
            };
        "#;
        let unit = parse(source).unwrap();
        assert_eq!(unit.decls.len(), 1);
        let Decl::Record(record) = &unit.decls[0] else {
            panic!("expected a record");
        };
        assert_eq!(record.name, "Demo");
        assert_eq!(record.bases.len(), 1);
        assert_eq!(record.bases[0].name, vec!["udo", "UDOperator"]);
        assert_eq!(record.bases[0].access, Access::Public);

        let methods: Vec<_> = record
            .members
            .iter()
            .filter_map(|m| match m {
                Member::Method(method) => Some(method.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(methods, vec!["accept", "process"]);
    }

    #[test]
    fn parses_template_calls_and_aggregates() {
        let source = r#"
            struct S {
               bool process(udo::ExecutionState state) {
                  emit<S>(state, OutputTuple{1, 2.5});
                  return 1 < 2;
               }
            };
        "#;
        let unit = parse(source).unwrap();
        let Decl::Record(record) = &unit.decls[0] else {
            panic!("expected a record");
        };
        let Member::Method(method) = &record.members[0] else {
            panic!("expected a method");
        };
        let body = method.body.as_ref().unwrap();
        assert_eq!(body.stmts.len(), 2);
        let Stmt::Expr(expr) = &body.stmts[0] else {
            panic!("expected an expression statement");
        };
        assert!(matches!(expr.kind, ExprKind::TemplateCall { .. }));
    }

    #[test]
    fn parses_member_init_lists() {
        let source = r#"
            struct Counter {
               int64_t count;
               Counter(int64_t start) : count(start) {}
            };
        "#;
        let unit = parse(source).unwrap();
        let Decl::Record(record) = &unit.decls[0] else {
            panic!("expected a record");
        };
        let ctor = record
            .members
            .iter()
            .find_map(|m| match m {
                Member::Constructor(ctor) => Some(ctor),
                _ => None,
            })
            .unwrap();
        assert_eq!(ctor.params.len(), 1);
        assert_eq!(ctor.inits.len(), 1);
        assert_eq!(ctor.inits[0].member, "count");
    }

    #[test]
    fn rejects_exceptions_and_thread_locals() {
        let source = "struct S { void f(udo::ExecutionState s) { throw 1; } };";
        assert!(parse(source).is_err());

        let source = "thread_local int x = 0;";
        let err = parse(source).unwrap_err();
        assert!(err.message().contains("thread_local"));
    }

    #[test]
    fn parses_control_flow() {
        let source = r#"
            struct S {
               uint32_t extraWork(udo::ExecutionState state, uint32_t step) {
                  uint32_t total = 0;
                  for (uint32_t i = 0; i < step; i += 1) {
                     if (i % 2 == 0)
                        total += i;
                     else
                        total += 1;
                  }
                  while (total > 100)
                     total -= 100;
                  return total;
               }
            };
        "#;
        parse(source).unwrap();
    }
}
