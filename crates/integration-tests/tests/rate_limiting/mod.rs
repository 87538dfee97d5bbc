mod check;
mod layer;
mod redis;
