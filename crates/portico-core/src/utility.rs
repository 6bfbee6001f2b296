//! Type identity strings and their human-readable form.

/// The opaque type identity string of a plugin class.
///
/// This is the primary key of a [`PluginDescriptor`](crate::PluginDescriptor)
/// and includes the full module path of the type.
pub fn symbol_of<T: 'static>() -> &'static str {
    std::any::type_name::<T>()
}

/// The identity string of an interface, usable with unsized trait objects.
pub fn interface_key<I: ?Sized + 'static>() -> &'static str {
    std::any::type_name::<I>()
}

/// Reduce a type identity string to its human-readable form.
///
/// Strips the leading `dyn ` marker and every module-path segment while
/// preserving generic structure:
///
/// ```
/// use portico_core::demangle;
///
/// assert_eq!(demangle("my_crate::widgets::Button"), "Button");
/// assert_eq!(demangle("dyn my_crate::Render"), "Render");
/// assert_eq!(demangle("a::Wrapper<b::Inner>"), "Wrapper<Inner>");
/// ```
pub fn demangle(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    let mut segment = String::new();
    let mut chars = symbol.chars().peekable();

    while let Some(c) = chars.next() {
        if c == ':' && chars.peek() == Some(&':') {
            // A path separator: everything accumulated so far was a module
            // or crate segment, not the final type name.
            chars.next();
            segment.clear();
        } else if c.is_alphanumeric() || c == '_' {
            segment.push(c);
        } else {
            out.push_str(&segment);
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(&segment);

    let trimmed = out.trim();
    let trimmed = trimmed.strip_prefix("dyn ").unwrap_or(trimmed);
    trimmed.to_string()
}
