//! End-to-end scenarios driven through the full queue and dispatcher

mod helpers;

mod cancel_midflight;
mod failure_handling;
mod limit_concurrent;
mod linear_success;
mod redirect_loop;
mod stop_branches;
