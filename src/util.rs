pub(crate) use self::peek::Peeked;

mod peek;
