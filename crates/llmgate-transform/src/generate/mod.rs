//! Pairwise conversions. Module `a2b` converts artifacts shaped as style
//! `a` into style `b`: requests, responses, and stream events each travel
//! in the module's direction.

pub mod claude2openai;
pub mod gemini2openai;
pub mod openai2claude;
pub mod openai2gemini;
pub mod openai2responses;
pub mod responses2openai;
