#![cfg(feature = "functional-tests")]

mod functional;
