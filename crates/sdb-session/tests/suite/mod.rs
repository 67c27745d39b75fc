mod breakpoints;
mod detach;
mod evaluate;
mod failures;
mod handshake;
mod launch;
mod stepping;
mod support;
