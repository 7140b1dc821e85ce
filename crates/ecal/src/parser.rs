//! Parser producing the AST the evaluator consumes.
//!
//! Statements are recursive descent; expressions use precedence climbing
//! with the binding powers mirrored in `ast::precedence`. The grammar is
//! whitespace insensitive apart from `return`, whose optional value must
//! start on the same line.

use std::sync::Arc;

use crate::{
    ast::{AstNode, CodeLoc, NodeKind, NodeValue},
    errors::{ErrorKind, EvalResult, RuntimeError},
    lexer::{Token, TokenKind, lex},
};

/// Parses `text` into an AST. `source` names the compilation unit and is
/// carried on every node position.
pub fn parse(source: &str, text: &str) -> EvalResult<AstNode> {
    let tokens = lex(source, text)?;
    let mut parser = Parser {
        src: Arc::from(source),
        tokens,
        idx: 0,
    };
    parser.parse_program()
}

struct Parser {
    src: Arc<str>,
    tokens: Vec<Token>,
    idx: usize,
}

/// Binding power of an infix operator token.
fn infix_power(kind: TokenKind) -> Option<(u8, NodeKind)> {
    Some(match kind {
        TokenKind::Or => (1, NodeKind::Or),
        TokenKind::And => (2, NodeKind::And),
        TokenKind::Eq => (4, NodeKind::Eq),
        TokenKind::Neq => (4, NodeKind::Neq),
        TokenKind::Gt => (4, NodeKind::Gt),
        TokenKind::Gte => (4, NodeKind::Gte),
        TokenKind::Lt => (4, NodeKind::Lt),
        TokenKind::Lte => (4, NodeKind::Lte),
        TokenKind::In => (4, NodeKind::In),
        TokenKind::NotIn => (4, NodeKind::NotIn),
        TokenKind::Plus => (5, NodeKind::Plus),
        TokenKind::Minus => (5, NodeKind::Minus),
        TokenKind::Star => (6, NodeKind::Times),
        TokenKind::Slash => (6, NodeKind::Div),
        TokenKind::SlashSlash => (6, NodeKind::DivInt),
        TokenKind::Percent => (6, NodeKind::ModInt),
        _ => return None,
    })
}

const POSTFIX_POWER: u8 = 8;

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.idx]
    }

    fn peek_kind(&self) -> TokenKind {
        self.tokens[self.idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.idx].clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        token
    }

    fn loc_here(&self) -> CodeLoc {
        self.peek().loc(&self.src)
    }

    fn error_here(&self, detail: String) -> RuntimeError {
        let mut err = RuntimeError::new(ErrorKind::InvalidConstruct, detail);
        err.source = self.src.to_string();
        err.loc = Some(self.loc_here());
        err
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> EvalResult<Token> {
        if self.peek_kind() == kind {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("Expected {what} but got: {}", self.peek())))
        }
    }

    fn skip_separators(&mut self) {
        while self.peek_kind() == TokenKind::Semicolon {
            self.advance();
        }
    }

    fn parse_program(&mut self) -> EvalResult<AstNode> {
        let loc = self.loc_here();
        let mut program = AstNode::new(NodeKind::Statements, loc);
        self.skip_separators();
        while self.peek_kind() != TokenKind::Eof {
            program.children.push(self.parse_statement()?);
            self.skip_separators();
        }
        Ok(program)
    }

    fn parse_block(&mut self) -> EvalResult<AstNode> {
        let open = self.expect(TokenKind::LBrace, "{")?;
        let mut block = AstNode::new(NodeKind::Statements, open.loc(&self.src));
        self.skip_separators();
        while self.peek_kind() != TokenKind::RBrace {
            if self.peek_kind() == TokenKind::Eof {
                return Err(self.error_here("Unterminated block".into()));
            }
            block.children.push(self.parse_statement()?);
            self.skip_separators();
        }
        self.advance();
        Ok(block)
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn parse_statement(&mut self) -> EvalResult<AstNode> {
        match self.peek_kind() {
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Break => {
                let token = self.advance();
                Ok(AstNode::new(NodeKind::Break, token.loc(&self.src)))
            }
            TokenKind::Continue => {
                let token = self.advance();
                Ok(AstNode::new(NodeKind::Continue, token.loc(&self.src)))
            }
            TokenKind::Return => self.parse_return(),
            TokenKind::Sink => self.parse_sink(),
            TokenKind::Import => self.parse_import(),
            TokenKind::Try => self.parse_try(),
            TokenKind::Mutex => self.parse_mutex(),
            _ => self.parse_assign_or_expr(),
        }
    }

    fn parse_assign_or_expr(&mut self) -> EvalResult<AstNode> {
        let first = self.parse_expr(0)?;
        if self.peek_kind() == TokenKind::Comma {
            let loc = first.loc.clone();
            let mut targets = AstNode::new(NodeKind::TargetList, loc.clone());
            targets.children.push(first);
            while self.peek_kind() == TokenKind::Comma {
                self.advance();
                targets.children.push(self.parse_expr(0)?);
            }
            let assign_token = self.expect(TokenKind::Assign, ":=")?;
            for target in &targets.children {
                self.check_assign_target(target)?;
            }
            let mut assign = AstNode::new(NodeKind::Assign, assign_token.loc(&self.src));
            assign.children.push(targets);
            assign.children.push(self.parse_expr(0)?);
            return Ok(assign);
        }
        if self.peek_kind() == TokenKind::Assign {
            let assign_token = self.advance();
            self.check_assign_target(&first)?;
            let mut assign = AstNode::new(NodeKind::Assign, assign_token.loc(&self.src));
            assign.children.push(first);
            assign.children.push(self.parse_expr(0)?);
            return Ok(assign);
        }
        Ok(first)
    }

    fn check_assign_target(&self, target: &AstNode) -> EvalResult<()> {
        let valid = match target.kind {
            NodeKind::Identifier => true,
            NodeKind::Access | NodeKind::Index => {
                self.check_assign_target(&target.children[0]).is_ok()
            }
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            let mut err = RuntimeError::new(
                ErrorKind::InvalidConstruct,
                format!("Cannot assign to: {target}"),
            );
            err = err.at_node(target);
            Err(err)
        }
    }

    fn parse_if(&mut self) -> EvalResult<AstNode> {
        let token = self.advance();
        let mut node = AstNode::new(NodeKind::If, token.loc(&self.src));
        loop {
            let loc = self.loc_here();
            let cond = self.parse_expr(0)?;
            let block = self.parse_block()?;
            let mut guard = AstNode::new(NodeKind::Guard, loc);
            guard.children.push(cond);
            guard.children.push(block);
            node.children.push(guard);
            match self.peek_kind() {
                TokenKind::Elif => {
                    self.advance();
                }
                TokenKind::Else => {
                    let else_token = self.advance();
                    let loc = else_token.loc(&self.src);
                    let block = self.parse_block()?;
                    let mut guard = AstNode::new(NodeKind::Guard, loc.clone());
                    guard.children.push(AstNode::new(NodeKind::True, loc));
                    guard.children.push(block);
                    node.children.push(guard);
                    break;
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_for(&mut self) -> EvalResult<AstNode> {
        let token = self.advance();
        let ident = self.expect(TokenKind::Ident, "loop variable")?;
        let var = AstNode::with_value(
            NodeKind::Identifier,
            ident.loc(&self.src),
            NodeValue::Name(ident.lit),
        );
        self.expect(TokenKind::In, "in")?;
        let iterable = self.parse_expr(0)?;
        let block = self.parse_block()?;
        let mut node = AstNode::new(NodeKind::Loop, token.loc(&self.src));
        node.children.push(var);
        node.children.push(iterable);
        node.children.push(block);
        Ok(node)
    }

    fn parse_return(&mut self) -> EvalResult<AstNode> {
        let token = self.advance();
        let mut node = AstNode::new(NodeKind::Return, token.loc(&self.src));
        let next = self.peek();
        let same_line = next.line == token.line;
        let terminates = matches!(
            next.kind,
            TokenKind::RBrace | TokenKind::Semicolon | TokenKind::Eof
        );
        if same_line && !terminates {
            node.children.push(self.parse_expr(0)?);
        }
        Ok(node)
    }

    fn parse_func(&mut self, named: bool) -> EvalResult<AstNode> {
        let token = self.advance();
        let name = if self.peek_kind() == TokenKind::Ident {
            Some(self.advance().lit)
        } else if named {
            return Err(self.error_here("Expected function name".into()));
        } else {
            None
        };
        let open = self.expect(TokenKind::LParen, "(")?;
        let mut params = AstNode::new(NodeKind::ParamList, open.loc(&self.src));
        while self.peek_kind() != TokenKind::RParen {
            let ident = self.expect(TokenKind::Ident, "parameter name")?;
            let mut param = AstNode::with_value(
                NodeKind::Param,
                ident.loc(&self.src),
                NodeValue::Name(ident.lit),
            );
            if self.peek_kind() == TokenKind::EqSingle {
                self.advance();
                param.children.push(self.parse_expr(0)?);
            }
            params.children.push(param);
            if self.peek_kind() == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, ")")?;
        let block = self.parse_block()?;
        let value = match name {
            Some(n) => NodeValue::Name(n),
            None => NodeValue::None,
        };
        let mut node = AstNode::with_value(NodeKind::FuncDecl, token.loc(&self.src), value);
        node.children.push(params);
        node.children.push(block);
        Ok(node)
    }

    fn parse_sink(&mut self) -> EvalResult<AstNode> {
        let token = self.advance();
        let name = self.expect(TokenKind::Ident, "sink name")?;
        let mut node = AstNode::with_value(
            NodeKind::Sink,
            token.loc(&self.src),
            NodeValue::Name(name.lit),
        );
        let mut seen = Vec::new();
        loop {
            let kind = match self.peek_kind() {
                TokenKind::Kindmatch => NodeKind::Kindmatch,
                TokenKind::Statematch => NodeKind::Statematch,
                TokenKind::Suppresses => NodeKind::Suppresses,
                TokenKind::Priority => NodeKind::Priority,
                TokenKind::LBrace => break,
                _ => {
                    return Err(self.error_here(format!(
                        "Expected sink clause or {{ but got: {}",
                        self.peek()
                    )));
                }
            };
            if seen.contains(&kind) {
                return Err(self.error_here(format!("Duplicate sink clause: {kind}")));
            }
            seen.push(kind);
            let clause_token = self.advance();
            let mut clause = AstNode::new(kind, clause_token.loc(&self.src));
            clause.children.push(self.parse_expr(0)?);
            node.children.push(clause);
            if self.peek_kind() == TokenKind::Comma {
                self.advance();
            }
        }
        node.children.push(self.parse_block()?);
        Ok(node)
    }

    fn parse_import(&mut self) -> EvalResult<AstNode> {
        let token = self.advance();
        let path = self.expect(TokenKind::Str, "import path string")?;
        let path_node = AstNode::with_value(
            NodeKind::StringLit,
            path.loc(&self.src),
            NodeValue::Str(path.lit),
        );
        self.expect(TokenKind::As, "as")?;
        let alias = self.expect(TokenKind::Ident, "import alias")?;
        let mut node = AstNode::with_value(
            NodeKind::Import,
            token.loc(&self.src),
            NodeValue::Name(alias.lit),
        );
        node.children.push(path_node);
        Ok(node)
    }

    fn parse_try(&mut self) -> EvalResult<AstNode> {
        let token = self.advance();
        let mut node = AstNode::new(NodeKind::Try, token.loc(&self.src));
        node.children.push(self.parse_block()?);
        loop {
            match self.peek_kind() {
                TokenKind::Except => {
                    let except_token = self.advance();
                    let value = if self.peek_kind() == TokenKind::Ident {
                        NodeValue::Name(self.advance().lit)
                    } else {
                        NodeValue::None
                    };
                    let mut handler =
                        AstNode::with_value(NodeKind::Except, except_token.loc(&self.src), value);
                    handler.children.push(self.parse_block()?);
                    node.children.push(handler);
                }
                TokenKind::Otherwise => {
                    let otherwise_token = self.advance();
                    let mut handler =
                        AstNode::new(NodeKind::Otherwise, otherwise_token.loc(&self.src));
                    handler.children.push(self.parse_block()?);
                    node.children.push(handler);
                }
                TokenKind::Finally => {
                    let finally_token = self.advance();
                    let mut handler = AstNode::new(NodeKind::Finally, finally_token.loc(&self.src));
                    handler.children.push(self.parse_block()?);
                    node.children.push(handler);
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_mutex(&mut self) -> EvalResult<AstNode> {
        let token = self.advance();
        let name = self.expect(TokenKind::Ident, "mutex name")?;
        let mut node = AstNode::with_value(
            NodeKind::Mutex,
            token.loc(&self.src),
            NodeValue::Name(name.lit),
        );
        node.children.push(self.parse_block()?);
        Ok(node)
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn parse_expr(&mut self, min_power: u8) -> EvalResult<AstNode> {
        let mut lhs = self.parse_prefix()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot if POSTFIX_POWER > min_power => {
                    self.advance();
                    let field = self.expect(TokenKind::Ident, "field name")?;
                    let mut access = AstNode::with_value(
                        NodeKind::Access,
                        field.loc(&self.src),
                        NodeValue::Name(field.lit),
                    );
                    access.children.push(lhs);
                    lhs = access;
                }
                TokenKind::LParen if POSTFIX_POWER > min_power => {
                    let open = self.advance();
                    let mut call = AstNode::new(NodeKind::Call, open.loc(&self.src));
                    call.children.push(lhs);
                    while self.peek_kind() != TokenKind::RParen {
                        call.children.push(self.parse_expr(0)?);
                        if self.peek_kind() == TokenKind::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, ")")?;
                    lhs = call;
                }
                TokenKind::LBracket if POSTFIX_POWER > min_power => {
                    let open = self.advance();
                    let mut index = AstNode::new(NodeKind::Index, open.loc(&self.src));
                    index.children.push(lhs);
                    index.children.push(self.parse_expr(0)?);
                    self.expect(TokenKind::RBracket, "]")?;
                    lhs = index;
                }
                kind => {
                    let Some((power, node_kind)) = infix_power(kind) else {
                        break;
                    };
                    if power <= min_power {
                        break;
                    }
                    let op = self.advance();
                    let rhs = self.parse_expr(power)?;
                    let mut node = AstNode::new(node_kind, op.loc(&self.src));
                    node.children.push(lhs);
                    node.children.push(rhs);
                    lhs = node;
                }
            }
        }
        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> EvalResult<AstNode> {
        match self.peek_kind() {
            TokenKind::Number => {
                let token = self.advance();
                Ok(AstNode::with_value(
                    NodeKind::Number,
                    token.loc(&self.src),
                    NodeValue::Num(token.num),
                ))
            }
            TokenKind::Str => {
                let token = self.advance();
                Ok(AstNode::with_value(
                    NodeKind::StringLit,
                    token.loc(&self.src),
                    NodeValue::Str(token.lit),
                ))
            }
            TokenKind::Ident => {
                let token = self.advance();
                Ok(AstNode::with_value(
                    NodeKind::Identifier,
                    token.loc(&self.src),
                    NodeValue::Name(token.lit),
                ))
            }
            TokenKind::True => Ok(AstNode::new(NodeKind::True, self.advance().loc(&self.src))),
            TokenKind::False => Ok(AstNode::new(NodeKind::False, self.advance().loc(&self.src))),
            TokenKind::Null => Ok(AstNode::new(NodeKind::Null, self.advance().loc(&self.src))),
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr(0)?;
                self.expect(TokenKind::RParen, ")")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let open = self.advance();
                let mut list = AstNode::new(NodeKind::ListLit, open.loc(&self.src));
                while self.peek_kind() != TokenKind::RBracket {
                    list.children.push(self.parse_expr(0)?);
                    if self.peek_kind() == TokenKind::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "]")?;
                Ok(list)
            }
            TokenKind::LBrace => {
                let open = self.advance();
                let mut map = AstNode::new(NodeKind::MapLit, open.loc(&self.src));
                while self.peek_kind() != TokenKind::RBrace {
                    let key = self.parse_expr(0)?;
                    let colon = self.expect(TokenKind::Colon, ":")?;
                    let value = self.parse_expr(0)?;
                    let mut entry = AstNode::new(NodeKind::KeyValue, colon.loc(&self.src));
                    entry.children.push(key);
                    entry.children.push(value);
                    map.children.push(entry);
                    if self.peek_kind() == TokenKind::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "}")?;
                Ok(map)
            }
            TokenKind::Minus => {
                let token = self.advance();
                let mut node = AstNode::new(NodeKind::Neg, token.loc(&self.src));
                node.children.push(self.parse_expr(7)?);
                Ok(node)
            }
            TokenKind::Plus => {
                let token = self.advance();
                let mut node = AstNode::new(NodeKind::Pos, token.loc(&self.src));
                node.children.push(self.parse_expr(7)?);
                Ok(node)
            }
            TokenKind::Not => {
                let token = self.advance();
                let mut node = AstNode::new(NodeKind::Not, token.loc(&self.src));
                node.children.push(self.parse_expr(3)?);
                Ok(node)
            }
            TokenKind::Func => self.parse_func(false),
            _ => Err(self.error_here(format!("Unexpected token: {}", self.peek()))),
        }
    }
}
