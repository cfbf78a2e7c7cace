//! The command registry.
//!
//! Commands are registered explicitly with their ordered argument names, the
//! schema of their answer, and a handler whose parameter types decide how each
//! argument is decoded:
//!
//! ```
//! use weft_amp::{CommandRegistry, FieldKind, Record, Schema};
//! use weft_defer::Failure;
//!
//! let mut registry = CommandRegistry::new();
//! registry
//!     .register(
//!         "sum",
//!         &["a", "b"],
//!         Schema::new().field("total", FieldKind::Integer),
//!         |a: i64, b: i64| -> Result<Record, Failure> { Ok(Record::new().with("total", a + b)) },
//!     )
//!     .unwrap();
//! assert!(registry.contains("sum"));
//! assert!(registry.contains("ping"));
//! ```

use std::collections::BTreeMap;
use std::collections::HashSet;

use thiserror::Error;
use weft_defer::{Deferred, Failure};

use crate::schema::{DecodeError, FieldKind, Record, Schema, Value};
use crate::wirebox::WireBox;

/// A handler parameter type.
pub trait FromValue: Sized {
    /// How the argument is decoded from the box.
    const KIND: FieldKind;

    fn from_value(value: Value) -> Result<Self, DecodeError>;
}

fn mismatch(expected: FieldKind, value: &Value) -> DecodeError {
    DecodeError::KindMismatch {
        expected,
        found: value.kind(),
    }
}

macro_rules! integer_from_value {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                const KIND: FieldKind = FieldKind::Integer;

                fn from_value(value: Value) -> Result<Self, DecodeError> {
                    match value {
                        Value::Integer(n) => <$ty>::try_from(n).map_err(|_| DecodeError::OutOfRange {
                            value: n,
                            target: stringify!($ty),
                        }),
                        other => Err(mismatch(Self::KIND, &other)),
                    }
                }
            }
        )*
    };
}

integer_from_value!(i64, i32, u16, u32, u64, usize);

impl FromValue for String {
    const KIND: FieldKind = FieldKind::Text;

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Text(text) => Ok(text),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl FromValue for bool {
    const KIND: FieldKind = FieldKind::Boolean;

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Boolean(flag) => Ok(flag),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl FromValue for Vec<u8> {
    const KIND: FieldKind = FieldKind::Bytes;

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

/// What a handler produced.
#[derive(Debug)]
pub enum Answer {
    /// Answer with the tag alone.
    Empty,
    /// Answer with these fields, per the command's response schema.
    Fields(Record),
    /// Answer when this fires.
    Later(Deferred<Record>),
    /// Answer with these fields, then close the connection.
    Quit(Record),
}

/// Handler result that answers and then hangs up.
///
/// A free-standing command returning `Quit` just closes the connection.
#[derive(Debug, Default)]
pub struct Quit(pub Record);

/// Handler return values.
pub trait IntoAnswer {
    fn into_answer(self) -> Answer;
}

impl IntoAnswer for () {
    fn into_answer(self) -> Answer {
        Answer::Empty
    }
}

impl IntoAnswer for Record {
    fn into_answer(self) -> Answer {
        Answer::Fields(self)
    }
}

impl IntoAnswer for Quit {
    fn into_answer(self) -> Answer {
        Answer::Quit(self.0)
    }
}

impl IntoAnswer for Deferred<Record> {
    fn into_answer(self) -> Answer {
        Answer::Later(self)
    }
}

impl IntoAnswer for Deferred<()> {
    fn into_answer(self) -> Answer {
        Answer::Later(self.map(|()| Record::new()))
    }
}

/// A function usable as a command handler.
///
/// Implemented for `Fn(A, B, ..) -> Result<R, Failure>` with up to six
/// [`FromValue`] parameters and an [`IntoAnswer`] result.
pub trait Handler<Args>: 'static {
    /// Parameter kinds, in order.
    const KINDS: &'static [FieldKind];

    /// Run with `args`, already decoded per [`Self::KINDS`].
    fn call(&self, args: Vec<Value>) -> Result<Answer, Failure>;
}

macro_rules! impl_handler {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg,)*> Handler<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Result<Ret, Failure> + 'static,
            Ret: IntoAnswer,
            $($arg: FromValue,)*
        {
            const KINDS: &'static [FieldKind] = &[$(<$arg as FromValue>::KIND),*];

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call(&self, args: Vec<Value>) -> Result<Answer, Failure> {
                let mut args = args.into_iter();
                $(
                    let $arg = match args.next() {
                        Some(value) => <$arg as FromValue>::from_value(value)?,
                        None => return Err(DecodeError::Missing(String::new()).into()),
                    };
                )*
                Ok(self($($arg),*)?.into_answer())
            }
        }
    };
}

impl_handler!();
impl_handler!(A);
impl_handler!(A, B);
impl_handler!(A, B, C);
impl_handler!(A, B, C, D);
impl_handler!(A, B, C, D, E);
impl_handler!(A, B, C, D, E, F);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("command {command:?} declares {declared} arguments but its handler takes {expected}")]
    ArityMismatch {
        command: String,
        declared: usize,
        expected: usize,
    },
    #[error("command {command:?} declares argument {argument:?} twice")]
    DuplicateArgument { command: String, argument: String },
    #[error("command {0:?} is already registered")]
    DuplicateCommand(String),
}

type ErasedHandler = Box<dyn Fn(Vec<Value>) -> Result<Answer, Failure>>;

/// One registered command.
pub struct Command {
    arguments: Vec<(String, FieldKind)>,
    response: Schema,
    handler: ErasedHandler,
}

impl Command {
    fn new<H, Args>(arguments: &[&str], response: Schema, handler: H) -> Self
    where
        H: Handler<Args>,
        Args: 'static,
    {
        Self {
            arguments: arguments
                .iter()
                .zip(H::KINDS)
                .map(|(name, kind)| ((*name).to_owned(), *kind))
                .collect(),
            response,
            handler: Box::new(move |args| handler.call(args)),
        }
    }

    pub fn arguments(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.arguments
            .iter()
            .map(|(name, kind)| (name.as_str(), *kind))
    }

    pub fn response(&self) -> &Schema {
        &self.response
    }

    /// Decode the declared arguments from `wire`, in declaration order, and
    /// run the handler.
    pub fn invoke(&self, wire: &WireBox) -> Result<Answer, Failure> {
        let mut args = Vec::with_capacity(self.arguments.len());
        for (name, kind) in self.arguments() {
            let value = wire
                .get_value(name, kind)
                .ok_or_else(|| DecodeError::Missing(name.to_owned()))??;
            args.push(value);
        }
        (self.handler)(args)
    }
}

/// Named commands an AMP connection answers.
pub struct CommandRegistry {
    commands: BTreeMap<String, Command>,
}

impl CommandRegistry {
    /// A registry holding the built-in `ping`.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry
            .commands
            .insert("ping".to_owned(), Command::new(&[], Schema::new(), ping));
        registry
    }

    /// A registry with no commands at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// Add a command.
    ///
    /// `arguments` names the handler's parameters in order; the count must
    /// match the handler's arity.
    pub fn register<H, Args>(
        &mut self,
        name: &str,
        arguments: &[&str],
        response: Schema,
        handler: H,
    ) -> Result<&mut Self, RegistrationError>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        if arguments.len() != H::KINDS.len() {
            return Err(RegistrationError::ArityMismatch {
                command: name.to_owned(),
                declared: arguments.len(),
                expected: H::KINDS.len(),
            });
        }
        let mut seen = HashSet::new();
        if let Some(argument) = arguments.iter().find(|argument| !seen.insert(**argument)) {
            return Err(RegistrationError::DuplicateArgument {
                command: name.to_owned(),
                argument: (*argument).to_owned(),
            });
        }
        if self.commands.contains_key(name) {
            return Err(RegistrationError::DuplicateCommand(name.to_owned()));
        }

        tracing::debug!(command = name, ?arguments, "registered command");
        self.commands
            .insert(name.to_owned(), Command::new(arguments, response, handler));
        Ok(self)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn ping() -> Result<(), Failure> {
    Ok(())
}
