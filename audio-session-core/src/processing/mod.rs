pub mod wave_format;
