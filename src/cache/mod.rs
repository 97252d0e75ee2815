pub mod falru;
