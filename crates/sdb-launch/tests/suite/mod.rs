mod process;
mod resolver;
