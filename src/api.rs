//! Convenience entry points for the common one-shot cases.
//!
//! Hosts with a single root structure per file rarely need to hold a
//! serializer across calls; these helpers build one, aim it at a pointer,
//! and run the root object through it.

use std::rc::Rc;

use crate::context::Context;
use crate::error::Result;
use crate::pointer::Pointer;
use crate::serializer::{
    BinaryDeserializer, BinarySerializer, Obj, Serializable, SerializerObject,
};

/// Reads a `T` rooted at `pointer`.
pub fn read_object<T: Serializable>(
    ctx: &Rc<Context>,
    pointer: &Pointer,
    name: Option<&str>,
) -> Result<Obj<T>> {
    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(pointer))?;
    s.serialize_object::<T>(None, name)
}

/// Reads a `T` rooted at the start of the registered file `key`.
pub fn read_file<T: Serializable>(ctx: &Rc<Context>, key: &str) -> Result<Obj<T>> {
    let pointer = ctx.start_pointer(key)?;
    read_object(ctx, &pointer, Some(key))
}

/// Writes `value` rooted at `pointer`.
pub fn write_object<T: Serializable>(
    ctx: &Rc<Context>,
    pointer: &Pointer,
    value: Obj<T>,
    name: Option<&str>,
) -> Result<Obj<T>> {
    let mut s = BinarySerializer::new(ctx.clone());
    s.goto(Some(pointer))?;
    s.serialize_object(Some(value), name)
}

/// Writes `value` rooted at the start of the registered file `key`.
pub fn write_file<T: Serializable>(ctx: &Rc<Context>, key: &str, value: Obj<T>) -> Result<Obj<T>> {
    let pointer = ctx.start_pointer(key)?;
    write_object(ctx, &pointer, value, Some(key))
}
