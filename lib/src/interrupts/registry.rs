use core::{
    error::Error,
    fmt::{Display, Formatter},
    ops::Deref,
};

use super::{
    dispatch, Dispatch, InterruptContext, InterruptHandler, DOUBLE_FAULT_VECTOR,
    MACHINE_CHECK_VECTOR, VECTOR_COUNT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    InvalidVector(usize),
    AlreadyRegistered(u8),
    /// Vector has a fixed handler that cannot be replaced
    Reserved(u8),
}

/// Handler table indexed by vector.
pub struct HandlerRegistry {
    handlers: [Option<InterruptHandler>; VECTOR_COUNT],
}

impl HandlerRegistry {
    pub const fn new() -> Self {
        Self {
            handlers: [None; VECTOR_COUNT],
        }
    }

    fn check(vector: usize) -> Result<u8, RegisterError> {
        let vector = u8::try_from(vector).map_err(|_| RegisterError::InvalidVector(vector))?;
        match vector {
            DOUBLE_FAULT_VECTOR | MACHINE_CHECK_VECTOR => Err(RegisterError::Reserved(vector)),
            _ => Ok(vector),
        }
    }

    /// Binds `handler` to a free vector.
    pub fn register_handler(
        &mut self,
        vector: usize,
        handler: InterruptHandler,
    ) -> Result<(), RegisterError> {
        let vector = Self::check(vector)?;
        let slot = &mut self.handlers[vector as usize];
        if slot.is_some() {
            return Err(RegisterError::AlreadyRegistered(vector));
        }
        *slot = Some(handler);

        Ok(())
    }

    /// Binds `handler` whether or not the vector was taken, returning the old one.
    pub fn replace_handler(
        &mut self,
        vector: usize,
        handler: InterruptHandler,
    ) -> Result<Option<InterruptHandler>, RegisterError> {
        let vector = Self::check(vector)?;
        Ok(self.handlers[vector as usize].replace(handler))
    }

    pub fn unregister_handler(
        &mut self,
        vector: usize,
    ) -> Result<Option<InterruptHandler>, RegisterError> {
        let vector = Self::check(vector)?;
        Ok(self.handlers[vector as usize].take())
    }

    pub fn is_registered(&self, vector: usize) -> bool {
        self.handlers.get(vector).is_some_and(Option::is_some)
    }

    pub fn handler(&self, vector: u8) -> Option<InterruptHandler> {
        self.handlers[vector as usize]
    }

    pub fn dispatch(&self, context: &mut InterruptContext) -> Dispatch {
        dispatch(self.handler(context.vector), context)
    }
}

/// Handler for `vector` from a table that may not have been lockable. When the
/// interrupted code holds the lock the vector gets no handler and takes its default.
pub fn handler_if_available<R: Deref<Target = HandlerRegistry>>(
    registry: Option<R>,
    vector: u8,
) -> Option<InterruptHandler> {
    registry.and_then(|registry| registry.handler(vector))
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RegisterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            RegisterError::InvalidVector(v) => write!(f, "vector {} out of range", v),
            RegisterError::AlreadyRegistered(v) => write!(f, "vector {} already has a handler", v),
            RegisterError::Reserved(v) => write!(f, "vector {} is reserved", v),
        }
    }
}

impl Error for RegisterError {}
