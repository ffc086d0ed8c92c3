pub(crate) mod cancel;
