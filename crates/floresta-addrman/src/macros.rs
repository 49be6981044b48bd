/// Implements `From<$from_thing>` for an error enum, wrapping it into `$field`.
macro_rules! impl_error_from {
    ($thing:ty, $from_thing:ty, $field:ident) => {
        impl From<$from_thing> for $thing {
            fn from(e: $from_thing) -> Self {
                <$thing>::$field(e)
            }
        }
    };
}

pub(crate) use impl_error_from;
