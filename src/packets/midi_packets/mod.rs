pub mod delta_time;
pub mod midi_command_list_header;
pub mod midi_packet;
pub mod midi_packet_header;
