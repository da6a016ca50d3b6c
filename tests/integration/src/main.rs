mod helpers;

mod admin;
mod hot_restart;
mod lifecycle;

fn main() {}
