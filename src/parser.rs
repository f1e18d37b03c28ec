// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Grammar-level parsing of VPS/SPS/PPS parameter sets and slice segment
//! headers, plus the [`Parser`] that owns the parameter-set tables, the
//! picture-order-count state and the sequence callback.

use anyhow::anyhow;
use anyhow::bail;
use enumn::N;
use log::debug;
use log::error;

use crate::bit_reader::BitReader;
use crate::format::AspectRatio;
use crate::format::ChromaFormat;
use crate::format::Codec;
use crate::format::Rational;
use crate::format::Rect;
use crate::format::VideoFormat;
use crate::format::VideoSignalDescription;
use crate::nalu::NalScan;
use crate::nalu::NaluHeader;
use crate::nalu::NaluScanner;
use crate::nalu::NaluType;
use crate::nalu::NALU_HEADER_LEN;
use crate::nalu::START_CODE_LEN;
use crate::rbsp;
use crate::ParserError;
use crate::ParserResult;

// Given the max VPS id.
const MAX_VPS_COUNT: usize = 16;
// Given the max SPS id.
const MAX_SPS_COUNT: usize = 32;
// Given the max PPS id.
const MAX_PPS_COUNT: usize = 64;
// 7.4.3.2.1: num_short_term_ref_pic_sets is in the range 0..=64.
const MAX_SHORT_TERM_REF_PIC_SETS: usize = 64;
// A.4.1: no more than 16 reference pictures in any RPS list.
const MAX_NUM_REF_PICS: usize = 16;
// 7.4.3.2.1: num_long_term_ref_pics_sps is in the range 0..=32.
const MAX_LONG_TERM_REF_PICS: usize = 32;
// 7.4.7.1
const MAX_REF_IDX_ACTIVE: u32 = 15;
// Enough to hold any parameter set or slice header; slice payloads past this
// point are entropy-coded data the parser never looks at.
const RBSP_BUF_SIZE: usize = 1024;

// Table 7-5: default values of ScalingList[0][matrixId][i].
const DEFAULT_SCALING_LIST_4X4: [u8; 16] = [16; 16];

// Table 7-6: default values of ScalingList[1..3][0..2][i].
const DEFAULT_SCALING_LIST_INTRA: [u8; 64] = [
    16, 16, 16, 16, 17, 18, 21, 24, //
    16, 16, 16, 16, 17, 19, 22, 25, //
    16, 16, 17, 18, 20, 22, 25, 29, //
    16, 16, 18, 21, 24, 27, 31, 36, //
    17, 17, 20, 24, 30, 35, 41, 47, //
    18, 19, 22, 27, 35, 44, 54, 65, //
    21, 22, 25, 31, 41, 54, 70, 88, //
    24, 25, 29, 36, 47, 65, 88, 115,
];

// Table 7-6: default values of ScalingList[1..3][3..5][i].
const DEFAULT_SCALING_LIST_INTER: [u8; 64] = [
    16, 16, 16, 16, 17, 18, 20, 24, //
    16, 16, 16, 17, 18, 20, 24, 25, //
    16, 16, 17, 18, 20, 24, 25, 28, //
    16, 17, 18, 20, 24, 25, 28, 33, //
    17, 18, 20, 24, 25, 28, 33, 41, //
    18, 20, 24, 25, 28, 33, 41, 54, //
    20, 24, 25, 28, 33, 41, 54, 71, //
    24, 25, 28, 33, 41, 54, 71, 91,
];

// Up-right diagonal scan order (6.5.3) for the 4x4 and 8x8 blocks; scaling
// list coefficients are stored at the scanned position.
const DIAG_SCAN_4X4: [usize; 16] = [0, 4, 1, 8, 5, 2, 12, 9, 6, 3, 13, 10, 7, 14, 11, 15];

const DIAG_SCAN_8X8: [usize; 64] = [
    0, 8, 1, 16, 9, 2, 24, 17, //
    10, 3, 32, 25, 18, 11, 4, 40, //
    33, 26, 19, 12, 5, 48, 41, 34, //
    27, 20, 13, 6, 56, 49, 42, 35, //
    28, 21, 14, 7, 57, 50, 43, 36, //
    29, 22, 15, 58, 51, 44, 37, 30, //
    23, 59, 52, 45, 38, 31, 60, 53, //
    46, 39, 61, 54, 47, 62, 55, 63,
];

/// Table 7-7 – Name association to slice_type.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum SliceType {
    B = 0,
    P = 1,
    #[default]
    I = 2,
}

impl SliceType {
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

/// profile_tier_level() data (7.3.3). The 44 reserved/constraint bits between
/// the source flags and the level are skipped, not retained.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flag: [bool; 32],
    /// Together with `general_interlaced_source_flag` this indicates the
    /// source scan type of the coded pictures; both set means it is signalled
    /// per picture, both unset means unknown.
    pub general_progressive_source_flag: bool,
    pub general_interlaced_source_flag: bool,
    pub general_non_packed_constraint_flag: bool,
    pub general_frame_only_constraint_flag: bool,
    pub general_level_idc: u8,
    pub sub_layer_profile_present_flag: [bool; 6],
    pub sub_layer_level_present_flag: [bool; 6],
    pub sub_layer_profile_space: [u8; 6],
    pub sub_layer_tier_flag: [bool; 6],
    pub sub_layer_profile_idc: [u8; 6],
    pub sub_layer_profile_compatibility_flag: [[bool; 32]; 6],
    pub sub_layer_progressive_source_flag: [bool; 6],
    pub sub_layer_interlaced_source_flag: [bool; 6],
    pub sub_layer_non_packed_constraint_flag: [bool; 6],
    pub sub_layer_frame_only_constraint_flag: [bool; 6],
    pub sub_layer_level_idc: [u8; 6],
}

/// sub_layer_hrd_parameters() (E.2.3).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubLayerHrdParameters {
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cpb_size_du_value_minus1: [u32; 32],
    pub bit_rate_du_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
}

/// hrd_parameters() (E.2.2), one entry per temporal sub-layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParameters {
    pub nal_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters_present_flag: bool,
    pub sub_pic_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub du_cpb_removal_delay_increment_length_minus1: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei_flag: bool,
    pub dpb_output_delay_du_length_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub fixed_pic_rate_general_flag: [bool; 7],
    pub fixed_pic_rate_within_cvs_flag: [bool; 7],
    pub elemental_duration_in_tc_minus1: [u32; 7],
    pub low_delay_hrd_flag: [bool; 7],
    pub cpb_cnt_minus1: [u32; 7],
    pub nal_sub_layer_hrd: [SubLayerHrdParameters; 7],
    pub vcl_sub_layer_hrd: [SubLayerHrdParameters; 7],
}

/// scaling_list_data() (7.3.4), kept in the raw [size_id][matrix_id] layout.
/// The first 16 entries of a size-0 list are meaningful; 64 entries for the
/// other sizes. DC coefficients exist for size ids 2 and 3 only and are
/// indexed [size_id - 2][matrix_id].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingListData {
    pub scaling_list_pred_mode_flag: [[bool; 6]; 4],
    pub scaling_list_pred_matrix_id_delta: [[u32; 6]; 4],
    pub scaling_list_dc_coef_minus8: [[i32; 6]; 2],
    pub scaling_list: [[[u8; 64]; 6]; 4],
    pub scaling_list_dc_coef: [[i32; 6]; 2],
}

impl Default for ScalingListData {
    fn default() -> Self {
        Self {
            scaling_list_pred_mode_flag: [[false; 6]; 4],
            scaling_list_pred_matrix_id_delta: [[0; 6]; 4],
            scaling_list_dc_coef_minus8: [[0; 6]; 2],
            scaling_list: [[[0; 64]; 6]; 4],
            scaling_list_dc_coef: [[0; 6]; 2],
        }
    }
}

/// st_ref_pic_set() (7.3.7). Besides the raw syntax elements this carries the
/// derived combined lists: `delta_poc`/`used_by_curr_pic` hold the negative
/// entries first, then the positive ones.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub inter_ref_pic_set_prediction_flag: bool,
    pub delta_idx_minus1: u32,
    pub delta_rps_sign: bool,
    pub abs_delta_rps_minus1: u32,
    pub used_by_curr_pic_flag: [bool; MAX_NUM_REF_PICS + 1],
    pub use_delta_flag: [bool; MAX_NUM_REF_PICS + 1],
    pub num_negative_pics: u32,
    pub num_positive_pics: u32,
    pub num_of_pics: u32,
    pub num_of_delta_poc: u32,
    pub delta_poc_s0_minus1: [u32; MAX_NUM_REF_PICS],
    pub used_by_curr_pic_s0_flag: [bool; MAX_NUM_REF_PICS],
    pub delta_poc_s1_minus1: [u32; MAX_NUM_REF_PICS],
    pub used_by_curr_pic_s1_flag: [bool; MAX_NUM_REF_PICS],
    pub delta_poc: [i32; MAX_NUM_REF_PICS + 1],
    pub used_by_curr_pic: [bool; MAX_NUM_REF_PICS + 1],
}

/// The long-term reference picture mirror kept alongside the raw SPS/slice
/// syntax: PocLsbLt[] and UsedByCurrPicLt[].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LongTermRefPicSet {
    pub num_of_pics: u32,
    pub pocs: [u32; MAX_LONG_TERM_REF_PICS],
    pub used_by_curr_pic: [bool; MAX_LONG_TERM_REF_PICS],
}

/// vui_parameters() (E.2.1).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParameters {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,
    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,
    pub default_display_window_flag: bool,
    pub def_disp_win_left_offset: u32,
    pub def_disp_win_right_offset: u32,
    pub def_disp_win_top_offset: u32,
    pub def_disp_win_bottom_offset: u32,
    pub vui_timing_info_present_flag: bool,
    pub vui_num_units_in_tick: u32,
    pub vui_time_scale: u32,
    pub vui_poc_proportional_to_timing_flag: bool,
    pub vui_num_ticks_poc_diff_one_minus1: u32,
    pub vui_hrd_parameters_present_flag: bool,
    pub hrd_parameters: HrdParameters,
    pub bitstream_restriction_flag: bool,
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub restricted_ref_pic_lists_flag: bool,
    pub min_spatial_segmentation_idc: u32,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_min_cu_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
}

/// A h.265 video parameter set (7.3.2.1).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    pub vps_video_parameter_set_id: u8,
    pub vps_base_layer_internal_flag: bool,
    pub vps_base_layer_available_flag: bool,
    pub vps_max_layers_minus1: u8,
    pub vps_max_sub_layers_minus1: u8,
    pub vps_temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub vps_sub_layer_ordering_info_present_flag: bool,
    /// DPB sizing per sub-layer; entries above index 0 inherit from index 0
    /// when `vps_sub_layer_ordering_info_present_flag` is unset.
    pub vps_max_dec_pic_buffering_minus1: [u32; 7],
    pub vps_max_num_reorder_pics: [u32; 7],
    pub vps_max_latency_increase_plus1: [u32; 7],
    pub vps_max_layer_id: u8,
    pub vps_num_layer_sets_minus1: u32,
    /// layer_id_included_flag[i][j], one row per layer set starting at set 1.
    pub layer_id_included_flag: Vec<Vec<bool>>,
    pub vps_timing_info_present_flag: bool,
    pub vps_num_units_in_tick: u32,
    pub vps_time_scale: u32,
    pub vps_poc_proportional_to_timing_flag: bool,
    pub vps_num_ticks_poc_diff_one_minus1: u32,
    pub vps_num_hrd_parameters: u32,
    pub hrd_layer_set_idx: Vec<u32>,
    pub cprms_present_flag: Vec<bool>,
    pub hrd_parameters: Vec<HrdParameters>,
    pub vps_extension_flag: bool,
}

/// A h.265 sequence parameter set (7.3.2.2).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub sps_video_parameter_set_id: u8,
    pub sps_max_sub_layers_minus1: u8,
    pub sps_temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub sps_seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    /// Sizes the slice_pic_order_cnt_lsb field; the value plus 4 is the lsb
    /// width in bits.
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sps_sub_layer_ordering_info_present_flag: bool,
    pub sps_max_dec_pic_buffering_minus1: [u32; 7],
    pub sps_max_num_reorder_pics: [u32; 7],
    pub sps_max_latency_increase_plus1: [u32; 7],
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_transform_block_size_minus2: u8,
    pub log2_diff_max_min_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    /* derived from the coding block log2 fields */
    pub max_cu_width: u32,
    pub max_cu_height: u32,
    pub max_cu_depth: u32,
    pub scaling_list_enabled_flag: bool,
    pub sps_scaling_list_data_present_flag: bool,
    pub scaling_list_data: ScalingListData,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    pub pcm_loop_filter_disabled_flag: bool,
    pub num_short_term_ref_pic_sets: u8,
    pub st_rps: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub lt_ref_pic_poc_lsb_sps: [u32; MAX_LONG_TERM_REF_PICS],
    pub used_by_curr_pic_lt_sps_flag: [bool; MAX_LONG_TERM_REF_PICS],
    pub lt_rps: LongTermRefPicSet,
    pub sps_temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParameters,
    pub sps_extension_flag: bool,
}

/// A h.265 picture parameter set (7.3.2.3), including the range extension
/// fields the slice header grammar consults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pps_pic_parameter_set_id: u8,
    pub pps_seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub init_qp_minus26: i32,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u32,
    pub pps_cb_qp_offset: i32,
    pub pps_cr_qp_offset: i32,
    pub pps_slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns_minus1: u32,
    pub num_tile_rows_minus1: u32,
    pub uniform_spacing_flag: bool,
    /// Explicit column widths and row heights; the last entry of each is
    /// derived by the decoder, not signalled.
    pub column_width_minus1: Vec<u32>,
    pub row_height_minus1: Vec<u32>,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub pps_loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub pps_deblocking_filter_disabled_flag: bool,
    pub pps_beta_offset_div2: i32,
    pub pps_tc_offset_div2: i32,
    pub pps_scaling_list_data_present_flag: bool,
    /// When `pps_scaling_list_data_present_flag` is unset this is a value
    /// copy of the referenced SPS's scaling list.
    pub scaling_list_data: ScalingListData,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u32,
    pub slice_segment_header_extension_present_flag: bool,
    pub pps_extension_present_flag: bool,
    pub pps_range_extension_flag: bool,
    pub pps_multilayer_extension_flag: bool,
    pub pps_extension_6bits: u8,
    /* pps_range_extension() */
    pub log2_max_transform_skip_block_size_minus2: u32,
    pub cross_component_prediction_enabled_flag: bool,
    pub chroma_qp_offset_list_enabled_flag: bool,
    pub diff_cu_chroma_qp_offset_depth: u32,
    pub chroma_qp_offset_list_len_minus1: u8,
    pub cb_qp_offset_list: [i32; 6],
    pub cr_qp_offset_list: [i32; 6],
    pub log2_sao_offset_scale_luma: u32,
    pub log2_sao_offset_scale_chroma: u32,
}

/// pred_weight_table() (7.3.6.3). Raw delta values as signalled; combining
/// them into effective weights is the decoder's job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u32,
    pub delta_chroma_log2_weight_denom: i32,
    pub luma_weight_l0_flag: [bool; 16],
    pub chroma_weight_l0_flag: [bool; 16],
    pub delta_luma_weight_l0: [i32; 16],
    pub luma_offset_l0: [i32; 16],
    pub delta_chroma_weight_l0: [[i32; 2]; 16],
    pub delta_chroma_offset_l0: [[i32; 2]; 16],
    pub luma_weight_l1_flag: [bool; 16],
    pub chroma_weight_l1_flag: [bool; 16],
    pub delta_luma_weight_l1: [i32; 16],
    pub luma_offset_l1: [i32; 16],
    pub delta_chroma_weight_l1: [[i32; 2]; 16],
    pub delta_chroma_offset_l1: [[i32; 2]; 16],
}

/// A slice_segment_header() (7.3.6.1).
///
/// For a dependent slice segment every field except the five identifying ones
/// (`first_slice_segment_in_pic_flag`, `no_output_of_prior_pics_flag`,
/// `slice_pic_parameter_set_id`, `dependent_slice_segment_flag`,
/// `slice_segment_address`) is inherited from the preceding independent
/// slice segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub slice_pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    pub slice_segment_address: u32,
    pub slice_type: SliceType,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    pub slice_pic_order_cnt_lsb: u32,
    pub short_term_ref_pic_set_sps_flag: bool,
    pub short_term_ref_pic_set_idx: u8,
    pub st_rps: ShortTermRefPicSet,
    /// Size in bits of the short-term RPS in this header, needed downstream
    /// for entropy alignment.
    pub short_term_ref_pic_set_size: u32,
    pub num_long_term_sps: u32,
    pub num_long_term_pics: u32,
    pub lt_idx_sps: [u32; MAX_LONG_TERM_REF_PICS],
    pub poc_lsb_lt: [u32; MAX_LONG_TERM_REF_PICS],
    pub used_by_curr_pic_lt_flag: [bool; MAX_LONG_TERM_REF_PICS],
    pub delta_poc_msb_present_flag: [bool; MAX_LONG_TERM_REF_PICS],
    pub delta_poc_msb_cycle_lt: [u32; MAX_LONG_TERM_REF_PICS],
    pub lt_rps: LongTermRefPicSet,
    pub slice_temporal_mvp_enabled_flag: bool,
    pub slice_sao_luma_flag: bool,
    pub slice_sao_chroma_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_flag_l1: bool,
    pub list_entry_l0: [u32; 16],
    pub list_entry_l1: [u32; 16],
    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u32,
    pub pred_weight_table: PredWeightTable,
    pub five_minus_max_num_merge_cand: u32,
    /// Raw signed delta; SliceQpY = 26 + init_qp_minus26 + slice_qp_delta is
    /// derived downstream.
    pub slice_qp_delta: i32,
    pub slice_cb_qp_offset: i32,
    pub slice_cr_qp_offset: i32,
    pub cu_chroma_qp_offset_enabled_flag: bool,
    pub deblocking_filter_override_flag: bool,
    pub slice_deblocking_filter_disabled_flag: bool,
    pub slice_beta_offset_div2: i32,
    pub slice_tc_offset_div2: i32,
    pub slice_loop_filter_across_slices_enabled_flag: bool,
    pub num_entry_point_offsets: u32,
    pub offset_len_minus1: u32,
    pub entry_point_offset_minus1: Vec<u32>,
    pub slice_segment_header_extension_length: u32,
    pub slice_segment_header_extension_data: Vec<u8>,
}

/// Picture order count state, carried across slices of a bitstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PocState {
    pub curr_poc: i32,
    pub curr_poc_lsb: i32,
    pub curr_poc_msb: i32,
    pub prev_poc: i32,
    pub prev_poc_lsb: i32,
    pub prev_poc_msb: i32,
    pub max_poc_lsb: i32,
}

// ceil(log2(val)); 0 for val <= 1.
fn ceil_log2(val: u32) -> usize {
    let mut bits = 0;
    while (1u64 << bits) < u64::from(val) {
        bits += 1;
    }
    bits
}

// PicOrderCntMsb derivation (8.3.1) for slices that are not IDR and not BLA.
fn derive_poc_msb(prev_lsb: i32, prev_msb: i32, curr_lsb: i32, max_lsb: i32) -> i32 {
    if curr_lsb < prev_lsb && prev_lsb - curr_lsb >= max_lsb / 2 {
        prev_msb + max_lsb
    } else if curr_lsb > prev_lsb && curr_lsb - prev_lsb > max_lsb / 2 {
        prev_msb - max_lsb
    } else {
        prev_msb
    }
}

/// The Annex B h.265 syntax parser.
///
/// Feed whole packets (zero or more concatenated Annex B framed NAL units)
/// to [`Parser::parse_video_data`]. Parameter sets are kept in fixed-capacity
/// tables keyed by their own id; slice headers update the POC state and the
/// active parameter-set registers. When a packet activates a new SPS, the
/// sequence callback receives a [`VideoFormat`] summary at packet end.
pub struct Parser {
    vps_table: [Option<Box<Vps>>; MAX_VPS_COUNT],
    sps_table: [Option<Box<Sps>>; MAX_SPS_COUNT],
    pps_table: [Option<Box<Pps>>; MAX_PPS_COUNT],

    active_vps_id: Option<u8>,
    active_sps_id: Option<u8>,
    active_pps_id: Option<u8>,

    poc: PocState,
    /// The most recently parsed slice header.
    slice_header: SliceHeader,
    /// Snapshot of the last independent slice header, the inheritance source
    /// for dependent slice segments.
    last_independent_header: SliceHeader,
    /// Slice NAL units seen in the current packet; only the first drives
    /// parser state.
    slice_num: u32,
    new_picture: bool,
    new_sps_activated: bool,

    /* current dimensions, for change detection */
    pic_width: u32,
    pic_height: u32,

    rbsp_buf: Box<[u8; RBSP_BUF_SIZE]>,
    on_sequence: Option<Box<dyn FnMut(&VideoFormat)>>,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            vps_table: Default::default(),
            sps_table: Default::default(),
            pps_table: std::array::from_fn(|_| None),
            active_vps_id: None,
            active_sps_id: None,
            active_pps_id: None,
            poc: Default::default(),
            slice_header: Default::default(),
            last_independent_header: Default::default(),
            slice_num: 0,
            new_picture: false,
            new_sps_activated: false,
            pic_width: 0,
            pic_height: 0,
            rbsp_buf: Box::new([0; RBSP_BUF_SIZE]),
            on_sequence: None,
        }
    }
}

impl Parser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Installs the callback invoked with a [`VideoFormat`] summary whenever
    /// a packet activates a new SPS.
    pub fn set_sequence_callback(&mut self, callback: impl FnMut(&VideoFormat) + 'static) {
        self.on_sequence = Some(Box::new(callback));
    }

    /// Returns a previously parsed VPS given `vps_id`, if any.
    pub fn get_vps(&self, vps_id: u8) -> Option<&Vps> {
        self.vps_table.get(usize::from(vps_id))?.as_deref()
    }

    /// Returns a previously parsed SPS given `sps_id`, if any.
    pub fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.sps_table.get(usize::from(sps_id))?.as_deref()
    }

    /// Returns a previously parsed PPS given `pps_id`, if any.
    pub fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.pps_table.get(usize::from(pps_id))?.as_deref()
    }

    /// The most recently parsed slice segment header.
    pub fn slice_header(&self) -> &SliceHeader {
        &self.slice_header
    }

    /// The VPS id activated by the last slice, if any.
    pub fn active_vps_id(&self) -> Option<u8> {
        self.active_vps_id
    }

    /// The SPS id activated by the last slice, if any.
    pub fn active_sps_id(&self) -> Option<u8> {
        self.active_sps_id
    }

    /// The PPS id activated by the last slice, if any.
    pub fn active_pps_id(&self) -> Option<u8> {
        self.active_pps_id
    }

    pub fn poc(&self) -> &PocState {
        &self.poc
    }

    /// Whether the last packet started a new picture, i.e. its first slice
    /// carried first_slice_segment_in_pic_flag.
    pub fn is_new_picture(&self) -> bool {
        self.new_picture
    }

    /// Parses one packet: consumes every NAL unit it contains in encounter
    /// order, then fires the sequence callback if a new SPS was activated.
    pub fn parse_video_data(&mut self, packet: &[u8]) -> ParserResult<()> {
        let mut scanner = NaluScanner::new(packet);
        let mut nalu_count = 0;

        self.slice_num = 0;
        self.new_picture = false;

        loop {
            let (unit, last) = match scanner.next_unit() {
                NalScan::Unit(unit) => (unit, false),
                NalScan::Eof(unit) => (unit, true),
                NalScan::NotFound => {
                    if nalu_count == 0 {
                        error!("no start code found in the packet data");
                        return Err(ParserError::NotFound);
                    }
                    break;
                }
            };
            nalu_count += 1;

            if unit.len() > START_CODE_LEN + NALU_HEADER_LEN {
                self.parse_nalu(unit)?;
            }

            if last {
                break;
            }
        }

        if self.new_sps_activated {
            self.new_sps_activated = false;
            let format = self.active_video_format()?;
            if let Some(callback) = self.on_sequence.as_mut() {
                callback(&format);
            }
        }

        Ok(())
    }

    fn parse_nalu(&mut self, unit: &[u8]) -> ParserResult<()> {
        let header = NaluHeader::parse(&unit[START_CODE_LEN..])?;

        let ebsp = &unit[START_CODE_LEN + NALU_HEADER_LEN..];
        let copy_len = ebsp.len().min(RBSP_BUF_SIZE);
        self.rbsp_buf[..copy_len].copy_from_slice(&ebsp[..copy_len]);
        let rbsp_len = rbsp::ebsp_to_rbsp(&mut self.rbsp_buf[..], copy_len)?;

        debug!("NAL unit {:?}, {} RBSP bytes", header.type_, rbsp_len);

        match header.type_ {
            NaluType::VpsNut => {
                let vps = Self::parse_vps(&self.rbsp_buf[..rbsp_len])?;
                let id = usize::from(vps.vps_video_parameter_set_id);
                self.vps_table[id] = Some(Box::new(vps));
            }
            NaluType::SpsNut => {
                let sps = Self::parse_sps(&self.rbsp_buf[..rbsp_len])?;
                let id = usize::from(sps.sps_seq_parameter_set_id);
                self.sps_table[id] = Some(Box::new(sps));
            }
            NaluType::PpsNut => {
                let pps = Self::parse_pps(&self.rbsp_buf[..rbsp_len], &self.sps_table)?;
                let id = usize::from(pps.pps_pic_parameter_set_id);
                self.pps_table[id] = Some(Box::new(pps));
            }
            type_ if type_.is_slice() => {
                // For each picture only the first slice header is decoded.
                if self.slice_num == 0 {
                    self.decode_slice_header(header.type_, rbsp_len)?;
                }
                self.slice_num += 1;
            }
            // AUD, SEI, EOS, filler and the reserved/unspecified types carry
            // nothing this parser needs.
            _ => (),
        }

        Ok(())
    }

    fn parse_profile_tier_level(
        ptl: &mut ProfileTierLevel,
        profile_present_flag: bool,
        max_num_sub_layers_minus1: u8,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        if profile_present_flag {
            ptl.general_profile_space = r.read_bits(2)?;
            ptl.general_tier_flag = r.read_bit();
            ptl.general_profile_idc = r.read_bits(5)?;

            for i in 0..32 {
                ptl.general_profile_compatibility_flag[i] = r.read_bit();
            }

            ptl.general_progressive_source_flag = r.read_bit();
            ptl.general_interlaced_source_flag = r.read_bit();
            ptl.general_non_packed_constraint_flag = r.read_bit();
            ptl.general_frame_only_constraint_flag = r.read_bit();

            // general_reserved_zero_44bits, shared with the profile-specific
            // constraint flags none of which are needed here.
            r.skip_bits(44);
        }

        ptl.general_level_idc = r.read_bits(8)?;

        for i in 0..usize::from(max_num_sub_layers_minus1) {
            ptl.sub_layer_profile_present_flag[i] = r.read_bit();
            ptl.sub_layer_level_present_flag[i] = r.read_bit();
        }

        if max_num_sub_layers_minus1 > 0 {
            for _ in max_num_sub_layers_minus1..8 {
                r.skip_bits(2); // reserved_zero_2bits
            }
        }

        for i in 0..usize::from(max_num_sub_layers_minus1) {
            if ptl.sub_layer_profile_present_flag[i] {
                ptl.sub_layer_profile_space[i] = r.read_bits(2)?;
                ptl.sub_layer_tier_flag[i] = r.read_bit();
                ptl.sub_layer_profile_idc[i] = r.read_bits(5)?;
                for j in 0..32 {
                    ptl.sub_layer_profile_compatibility_flag[i][j] = r.read_bit();
                }
                ptl.sub_layer_progressive_source_flag[i] = r.read_bit();
                ptl.sub_layer_interlaced_source_flag[i] = r.read_bit();
                ptl.sub_layer_non_packed_constraint_flag[i] = r.read_bit();
                ptl.sub_layer_frame_only_constraint_flag[i] = r.read_bit();
                r.skip_bits(44);
            }
            if ptl.sub_layer_level_present_flag[i] {
                ptl.sub_layer_level_idc[i] = r.read_bits(8)?;
            }
        }

        Ok(())
    }

    fn parse_sub_layer_hrd_parameters(
        sub_hrd: &mut SubLayerHrdParameters,
        cpb_cnt_minus1: u32,
        sub_pic_hrd_params_present_flag: bool,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        for i in 0..=cpb_cnt_minus1 as usize {
            sub_hrd.bit_rate_value_minus1[i] = r.read_ue()?;
            sub_hrd.cpb_size_value_minus1[i] = r.read_ue()?;
            if sub_pic_hrd_params_present_flag {
                sub_hrd.cpb_size_du_value_minus1[i] = r.read_ue()?;
                sub_hrd.bit_rate_du_value_minus1[i] = r.read_ue()?;
            }
            sub_hrd.cbr_flag[i] = r.read_bit();
        }

        Ok(())
    }

    fn parse_hrd_parameters(
        hrd: &mut HrdParameters,
        common_inf_present_flag: bool,
        max_num_sub_layers_minus1: u8,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        if common_inf_present_flag {
            hrd.nal_hrd_parameters_present_flag = r.read_bit();
            hrd.vcl_hrd_parameters_present_flag = r.read_bit();
            if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
                hrd.sub_pic_hrd_params_present_flag = r.read_bit();
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.tick_divisor_minus2 = r.read_bits(8)?;
                    hrd.du_cpb_removal_delay_increment_length_minus1 = r.read_bits(5)?;
                    hrd.sub_pic_cpb_params_in_pic_timing_sei_flag = r.read_bit();
                    hrd.dpb_output_delay_du_length_minus1 = r.read_bits(5)?;
                }
                hrd.bit_rate_scale = r.read_bits(4)?;
                hrd.cpb_size_scale = r.read_bits(4)?;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.cpb_size_du_scale = r.read_bits(4)?;
                }
                hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
                hrd.au_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
                hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
            }
        }

        for i in 0..=usize::from(max_num_sub_layers_minus1) {
            hrd.fixed_pic_rate_general_flag[i] = r.read_bit();
            hrd.fixed_pic_rate_within_cvs_flag[i] = if !hrd.fixed_pic_rate_general_flag[i] {
                r.read_bit()
            } else {
                true
            };

            if hrd.fixed_pic_rate_within_cvs_flag[i] {
                hrd.elemental_duration_in_tc_minus1[i] = r.read_ue_max(2047)?;
            } else {
                hrd.low_delay_hrd_flag[i] = r.read_bit();
            }

            if !hrd.low_delay_hrd_flag[i] {
                hrd.cpb_cnt_minus1[i] = r.read_ue_max(31)?;
            }

            let cpb_cnt_minus1 = hrd.cpb_cnt_minus1[i];
            let sub_pic = hrd.sub_pic_hrd_params_present_flag;

            if hrd.nal_hrd_parameters_present_flag {
                Self::parse_sub_layer_hrd_parameters(
                    &mut hrd.nal_sub_layer_hrd[i],
                    cpb_cnt_minus1,
                    sub_pic,
                    r,
                )?;
            }
            if hrd.vcl_hrd_parameters_present_flag {
                Self::parse_sub_layer_hrd_parameters(
                    &mut hrd.vcl_sub_layer_hrd[i],
                    cpb_cnt_minus1,
                    sub_pic,
                    r,
                )?;
            }
        }

        Ok(())
    }

    /// Seeds `sl` with the Table 7-5 / Table 7-6 default lists. Must run
    /// before [`Self::parse_scaling_list`], whose pred_matrix_id_delta == 0
    /// case keeps the defaults in place.
    fn set_default_scaling_list(sl: &mut ScalingListData) {
        for matrix_id in 0..6 {
            sl.scaling_list_dc_coef[0][matrix_id] = 16;
            sl.scaling_list_dc_coef[1][matrix_id] = 16;
        }

        for matrix_id in 0..6 {
            sl.scaling_list[0][matrix_id][..16].copy_from_slice(&DEFAULT_SCALING_LIST_4X4);
        }

        for size_id in 1..4 {
            for matrix_id in 0..3 {
                sl.scaling_list[size_id][matrix_id] = DEFAULT_SCALING_LIST_INTRA;
            }
            for matrix_id in 3..6 {
                sl.scaling_list[size_id][matrix_id] = DEFAULT_SCALING_LIST_INTER;
            }
        }
    }

    fn parse_scaling_list(
        sl: &mut ScalingListData,
        chroma_format_idc: u8,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        // 7.3.4
        for size_id in 0..4usize {
            let step = if size_id == 3 { 3 } else { 1 };
            let mut matrix_id = 0usize;
            while matrix_id < 6 {
                let pred_mode = r.read_bit();
                sl.scaling_list_pred_mode_flag[size_id][matrix_id] = pred_mode;

                if !pred_mode {
                    let delta: u32 = r.read_ue_max(5)?;
                    sl.scaling_list_pred_matrix_id_delta[size_id][matrix_id] = delta;
                    // delta == 0 keeps the default list the caller seeded.
                    if delta != 0 {
                        // (7-42)
                        let factor = if size_id == 3 { 3u32 } else { 1 };
                        let ref_matrix_id = (matrix_id as i64) - i64::from(delta * factor);
                        if ref_matrix_id < 0 {
                            bail!("invalid scaling_list_pred_matrix_id_delta {}", delta);
                        }
                        let ref_matrix_id = ref_matrix_id as usize;

                        let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));
                        let src = sl.scaling_list[size_id][ref_matrix_id];
                        sl.scaling_list[size_id][matrix_id][..coef_num]
                            .copy_from_slice(&src[..coef_num]);

                        if size_id > 1 {
                            sl.scaling_list_dc_coef[size_id - 2][matrix_id] =
                                sl.scaling_list_dc_coef[size_id - 2][ref_matrix_id];
                        }
                    }
                } else {
                    let mut next_coef: i32 = 8;
                    let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));

                    if size_id > 1 {
                        let dc_minus8: i32 = r.read_se_bounded(-7, 247)?;
                        sl.scaling_list_dc_coef_minus8[size_id - 2][matrix_id] = dc_minus8;
                        next_coef = dc_minus8 + 8;
                        sl.scaling_list_dc_coef[size_id - 2][matrix_id] = next_coef;
                    }

                    for i in 0..coef_num {
                        let delta_coef: i32 = r.read_se_bounded(-128, 127)?;
                        next_coef = (next_coef + delta_coef + 256) % 256;
                        let scan = if size_id == 0 {
                            DIAG_SCAN_4X4[i]
                        } else {
                            DIAG_SCAN_8X8[i]
                        };
                        sl.scaling_list[size_id][matrix_id][scan] = next_coef as u8;
                    }
                }

                matrix_id += step;
            }
        }

        // For 4:4:4 the chroma 32x32 lists mirror the 16x16 ones.
        if chroma_format_idc == 3 {
            for &matrix_id in &[1usize, 2, 4, 5] {
                sl.scaling_list[3][matrix_id] = sl.scaling_list[2][matrix_id];
                sl.scaling_list_dc_coef[1][matrix_id] = sl.scaling_list_dc_coef[0][matrix_id];
            }
        }

        Ok(())
    }

    fn parse_short_term_ref_pic_set(
        rps: &mut ShortTermRefPicSet,
        st_rps_idx: u32,
        num_short_term_ref_pic_sets: u32,
        ref_sets: &[ShortTermRefPicSet],
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        rps.inter_ref_pic_set_prediction_flag = if st_rps_idx != 0 { r.read_bit() } else { false };

        if rps.inter_ref_pic_set_prediction_flag {
            // delta_idx_minus1 is only signalled for the set carried in the
            // slice header itself; sets inside the SPS reference the
            // immediately preceding one.
            rps.delta_idx_minus1 = if st_rps_idx == num_short_term_ref_pic_sets {
                r.read_ue_max(st_rps_idx - 1)?
            } else {
                0
            };
            rps.delta_rps_sign = r.read_bit();
            rps.abs_delta_rps_minus1 = r.read_ue_max(32767)?;

            // (7-59)
            let delta_rps =
                (1 - 2 * i32::from(rps.delta_rps_sign)) * (rps.abs_delta_rps_minus1 as i32 + 1);
            let ref_idx = st_rps_idx
                .checked_sub(rps.delta_idx_minus1 + 1)
                .ok_or_else(|| anyhow!("invalid delta_idx_minus1 {}", rps.delta_idx_minus1))?
                as usize;
            let ref_rps = ref_sets
                .get(ref_idx)
                .ok_or_else(|| anyhow!("reference RPS {} not available", ref_idx))?;

            let ref_neg = ref_rps.num_negative_pics as usize;
            let ref_pos = ref_rps.num_positive_pics as usize;
            let ref_num_pics = ref_rps.num_of_pics as usize;
            let ref_num_delta = ref_rps.num_of_delta_poc as usize;
            if ref_num_pics > MAX_NUM_REF_PICS || ref_num_delta > MAX_NUM_REF_PICS {
                bail!("reference RPS {} holds too many pictures", ref_idx);
            }

            for j in 0..=ref_num_delta {
                rps.used_by_curr_pic_flag[j] = r.read_bit();
                rps.use_delta_flag[j] = if !rps.used_by_curr_pic_flag[j] {
                    r.read_bit()
                } else {
                    true
                };
            }

            // (7-61): negative entries are synthesized from the reference's
            // positive list walked in reverse, then the delta itself when it
            // crosses zero, then the reference's negative list in order.
            let mut i = 0usize;
            for j in (0..ref_pos).rev() {
                let delta_poc = delta_rps + ref_rps.delta_poc[ref_neg + j];
                if delta_poc < 0 && rps.use_delta_flag[ref_neg + j] {
                    rps.delta_poc[i] = delta_poc;
                    rps.used_by_curr_pic[i] = rps.used_by_curr_pic_flag[ref_neg + j];
                    i += 1;
                }
            }
            if delta_rps < 0 && rps.use_delta_flag[ref_num_pics] {
                rps.delta_poc[i] = delta_rps;
                rps.used_by_curr_pic[i] = rps.used_by_curr_pic_flag[ref_num_pics];
                i += 1;
            }
            for j in 0..ref_neg {
                let delta_poc = delta_rps + ref_rps.delta_poc[j];
                if delta_poc < 0 && rps.use_delta_flag[j] {
                    rps.delta_poc[i] = delta_poc;
                    rps.used_by_curr_pic[i] = rps.used_by_curr_pic_flag[j];
                    i += 1;
                }
            }
            rps.num_negative_pics = i as u32;

            // (7-62): positive entries, same walk with the signs flipped.
            for j in (0..ref_neg).rev() {
                let delta_poc = delta_rps + ref_rps.delta_poc[j];
                if delta_poc > 0 && rps.use_delta_flag[j] {
                    rps.delta_poc[i] = delta_poc;
                    rps.used_by_curr_pic[i] = rps.used_by_curr_pic_flag[j];
                    i += 1;
                }
            }
            if delta_rps > 0 && rps.use_delta_flag[ref_num_pics] {
                rps.delta_poc[i] = delta_rps;
                rps.used_by_curr_pic[i] = rps.used_by_curr_pic_flag[ref_num_pics];
                i += 1;
            }
            for j in 0..ref_pos {
                let delta_poc = delta_rps + ref_rps.delta_poc[ref_neg + j];
                if delta_poc > 0 && rps.use_delta_flag[ref_neg + j] {
                    rps.delta_poc[i] = delta_poc;
                    rps.used_by_curr_pic[i] = rps.used_by_curr_pic_flag[ref_neg + j];
                    i += 1;
                }
            }
            rps.num_positive_pics = i as u32 - rps.num_negative_pics;
            rps.num_of_delta_poc = ref_rps.num_negative_pics + ref_rps.num_positive_pics;
            rps.num_of_pics = i as u32;
        } else {
            rps.num_negative_pics = r.read_ue_max(MAX_NUM_REF_PICS as u32)?;
            rps.num_positive_pics = r.read_ue_max(MAX_NUM_REF_PICS as u32 - rps.num_negative_pics)?;

            // DeltaPocS0, UsedByCurrPicS0
            let mut prev = 0i32;
            for j in 0..rps.num_negative_pics as usize {
                rps.delta_poc_s0_minus1[j] = r.read_ue_max(32767)?;
                let poc = prev - rps.delta_poc_s0_minus1[j] as i32 - 1;
                prev = poc;
                rps.delta_poc[j] = poc;
                rps.used_by_curr_pic_s0_flag[j] = r.read_bit();
                rps.used_by_curr_pic[j] = rps.used_by_curr_pic_s0_flag[j];
            }

            // DeltaPocS1, UsedByCurrPicS1
            let mut prev = 0i32;
            let neg = rps.num_negative_pics as usize;
            for j in 0..rps.num_positive_pics as usize {
                rps.delta_poc_s1_minus1[j] = r.read_ue_max(32767)?;
                let poc = prev + rps.delta_poc_s1_minus1[j] as i32 + 1;
                prev = poc;
                rps.delta_poc[neg + j] = poc;
                rps.used_by_curr_pic_s1_flag[j] = r.read_bit();
                rps.used_by_curr_pic[neg + j] = rps.used_by_curr_pic_s1_flag[j];
            }

            rps.num_of_pics = rps.num_negative_pics + rps.num_positive_pics;
            rps.num_of_delta_poc = rps.num_of_pics;
        }

        Ok(())
    }

    fn parse_vui_parameters(
        vui: &mut VuiParameters,
        max_num_sub_layers_minus1: u8,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        vui.aspect_ratio_info_present_flag = r.read_bit();
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            const EXTENDED_SAR: u8 = 255;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit();
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit();
        }

        vui.video_signal_type_present_flag = r.read_bit();
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit();
            vui.colour_description_present_flag = r.read_bit();
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coeffs = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit();
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.neutral_chroma_indication_flag = r.read_bit();
        vui.field_seq_flag = r.read_bit();
        vui.frame_field_info_present_flag = r.read_bit();

        vui.default_display_window_flag = r.read_bit();
        if vui.default_display_window_flag {
            vui.def_disp_win_left_offset = r.read_ue()?;
            vui.def_disp_win_right_offset = r.read_ue()?;
            vui.def_disp_win_top_offset = r.read_ue()?;
            vui.def_disp_win_bottom_offset = r.read_ue()?;
        }

        vui.vui_timing_info_present_flag = r.read_bit();
        if vui.vui_timing_info_present_flag {
            vui.vui_num_units_in_tick = r.read_bits(32)?;
            vui.vui_time_scale = r.read_bits(32)?;
            vui.vui_poc_proportional_to_timing_flag = r.read_bit();
            if vui.vui_poc_proportional_to_timing_flag {
                vui.vui_num_ticks_poc_diff_one_minus1 = r.read_ue()?;
            }
            vui.vui_hrd_parameters_present_flag = r.read_bit();
            if vui.vui_hrd_parameters_present_flag {
                if let Err(err) = Self::parse_hrd_parameters(
                    &mut vui.hrd_parameters,
                    true,
                    max_num_sub_layers_minus1,
                    r,
                ) {
                    error!("ill-formed HRD parameters, keeping defaults: {:#}", err);
                }
            }
        }

        vui.bitstream_restriction_flag = r.read_bit();
        if vui.bitstream_restriction_flag {
            vui.tiles_fixed_structure_flag = r.read_bit();
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit();
            vui.restricted_ref_pic_lists_flag = r.read_bit();
            vui.min_spatial_segmentation_idc = r.read_ue_max(4095)?;
            vui.max_bytes_per_pic_denom = r.read_ue()?;
            vui.max_bits_per_min_cu_denom = r.read_ue()?;
            vui.log2_max_mv_length_horizontal = r.read_ue()?;
            vui.log2_max_mv_length_vertical = r.read_ue()?;
        }

        Ok(())
    }

    fn parse_vps(rbsp: &[u8]) -> anyhow::Result<Vps> {
        let mut r = BitReader::new(rbsp);

        let mut vps = Vps {
            vps_video_parameter_set_id: r.read_bits(4)?,
            vps_base_layer_internal_flag: r.read_bit(),
            vps_base_layer_available_flag: r.read_bit(),
            vps_max_layers_minus1: r.read_bits(6)?,
            vps_max_sub_layers_minus1: r.read_bits(3)?,
            vps_temporal_id_nesting_flag: r.read_bit(),
            ..Default::default()
        };

        if vps.vps_max_sub_layers_minus1 > 6 {
            bail!(
                "invalid vps_max_sub_layers_minus1 {}",
                vps.vps_max_sub_layers_minus1
            );
        }

        r.skip_bits(16); // vps_reserved_0xffff_16bits

        Self::parse_profile_tier_level(
            &mut vps.profile_tier_level,
            true,
            vps.vps_max_sub_layers_minus1,
            &mut r,
        )?;

        vps.vps_sub_layer_ordering_info_present_flag = r.read_bit();
        for i in 0..=usize::from(vps.vps_max_sub_layers_minus1) {
            if vps.vps_sub_layer_ordering_info_present_flag || i == 0 {
                vps.vps_max_dec_pic_buffering_minus1[i] = r.read_ue()?;
                vps.vps_max_num_reorder_pics[i] = r.read_ue()?;
                vps.vps_max_latency_increase_plus1[i] = r.read_ue()?;
            } else {
                vps.vps_max_dec_pic_buffering_minus1[i] = vps.vps_max_dec_pic_buffering_minus1[0];
                vps.vps_max_num_reorder_pics[i] = vps.vps_max_num_reorder_pics[0];
                vps.vps_max_latency_increase_plus1[i] = vps.vps_max_latency_increase_plus1[0];
            }
        }

        vps.vps_max_layer_id = r.read_bits(6)?;
        if vps.vps_max_layer_id > 62 {
            bail!("invalid vps_max_layer_id {}", vps.vps_max_layer_id);
        }
        vps.vps_num_layer_sets_minus1 = r.read_ue_max(1023)?;
        for _ in 1..=vps.vps_num_layer_sets_minus1 {
            let mut included = Vec::with_capacity(usize::from(vps.vps_max_layer_id) + 1);
            for _ in 0..=vps.vps_max_layer_id {
                included.push(r.read_bit());
            }
            vps.layer_id_included_flag.push(included);
        }

        vps.vps_timing_info_present_flag = r.read_bit();
        if vps.vps_timing_info_present_flag {
            vps.vps_num_units_in_tick = r.read_bits(32)?;
            vps.vps_time_scale = r.read_bits(32)?;
            vps.vps_poc_proportional_to_timing_flag = r.read_bit();
            if vps.vps_poc_proportional_to_timing_flag {
                vps.vps_num_ticks_poc_diff_one_minus1 = r.read_ue()?;
            }

            vps.vps_num_hrd_parameters = r.read_ue_max(vps.vps_num_layer_sets_minus1 + 1)?;
            for i in 0..vps.vps_num_hrd_parameters as usize {
                vps.hrd_layer_set_idx.push(r.read_ue()?);
                // cprms_present_flag[0] is inferred to be 1.
                let cprms_present = if i == 0 { true } else { r.read_bit() };
                vps.cprms_present_flag.push(cprms_present);

                let mut hrd = HrdParameters::default();
                if let Err(err) = Self::parse_hrd_parameters(
                    &mut hrd,
                    cprms_present,
                    vps.vps_max_sub_layers_minus1,
                    &mut r,
                ) {
                    error!("ill-formed HRD parameters, keeping defaults: {:#}", err);
                }
                vps.hrd_parameters.push(hrd);
            }
        }

        vps.vps_extension_flag = r.read_bit();

        Ok(vps)
    }

    fn parse_sps(rbsp: &[u8]) -> anyhow::Result<Sps> {
        let mut r = BitReader::new(rbsp);

        let vps_id: u8 = r.read_bits(4)?;
        let max_sub_layers_minus1: u8 = r.read_bits(3)?;
        if max_sub_layers_minus1 > 6 {
            bail!("invalid sps_max_sub_layers_minus1 {}", max_sub_layers_minus1);
        }
        let temporal_id_nesting_flag = r.read_bit();

        let mut ptl = ProfileTierLevel::default();
        Self::parse_profile_tier_level(&mut ptl, true, max_sub_layers_minus1, &mut r)?;

        let sps_id: u8 = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;

        let mut sps = Sps {
            sps_video_parameter_set_id: vps_id,
            sps_max_sub_layers_minus1: max_sub_layers_minus1,
            sps_temporal_id_nesting_flag: temporal_id_nesting_flag,
            profile_tier_level: ptl,
            sps_seq_parameter_set_id: sps_id,
            ..Default::default()
        };

        sps.chroma_format_idc = r.read_ue_max(3)?;
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_bit();
        }

        sps.pic_width_in_luma_samples = r.read_ue_bounded(1, 16888)?;
        sps.pic_height_in_luma_samples = r.read_ue_bounded(1, 16888)?;

        sps.conformance_window_flag = r.read_bit();
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.read_ue()?;
            sps.conf_win_right_offset = r.read_ue()?;
            sps.conf_win_top_offset = r.read_ue()?;
            sps.conf_win_bottom_offset = r.read_ue()?;
        }

        sps.bit_depth_luma_minus8 = r.read_ue_max(8)?;
        sps.bit_depth_chroma_minus8 = r.read_ue_max(8)?;
        sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;

        sps.sps_sub_layer_ordering_info_present_flag = r.read_bit();
        for i in 0..=usize::from(max_sub_layers_minus1) {
            if sps.sps_sub_layer_ordering_info_present_flag || i == 0 {
                sps.sps_max_dec_pic_buffering_minus1[i] = r.read_ue_max(16)?;
                sps.sps_max_num_reorder_pics[i] =
                    r.read_ue_max(sps.sps_max_dec_pic_buffering_minus1[i])?;
                sps.sps_max_latency_increase_plus1[i] = r.read_ue()?;
            } else {
                sps.sps_max_dec_pic_buffering_minus1[i] = sps.sps_max_dec_pic_buffering_minus1[0];
                sps.sps_max_num_reorder_pics[i] = sps.sps_max_num_reorder_pics[0];
                sps.sps_max_latency_increase_plus1[i] = sps.sps_max_latency_increase_plus1[0];
            }
        }

        sps.log2_min_luma_coding_block_size_minus3 = r.read_ue()?;
        let log2_min_cu_size = u32::from(sps.log2_min_luma_coding_block_size_minus3) + 3;

        sps.log2_diff_max_min_luma_coding_block_size = r.read_ue()?;
        let max_cu_depth_delta = u32::from(sps.log2_diff_max_min_luma_coding_block_size);

        // CtbLog2SizeY must not exceed 6 (A.4.1).
        if log2_min_cu_size + max_cu_depth_delta > 6 {
            bail!("invalid luma coding block sizing");
        }
        sps.max_cu_width = 1 << (log2_min_cu_size + max_cu_depth_delta);
        sps.max_cu_height = sps.max_cu_width;

        sps.log2_min_transform_block_size_minus2 = r.read_ue()?;
        let quadtree_tu_log2_min_size = u32::from(sps.log2_min_transform_block_size_minus2) + 2;
        let add_cu_depth = log2_min_cu_size.saturating_sub(quadtree_tu_log2_min_size);
        sps.max_cu_depth = max_cu_depth_delta + add_cu_depth;

        sps.log2_diff_max_min_transform_block_size = r.read_ue()?;
        sps.max_transform_hierarchy_depth_inter = r.read_ue()?;
        sps.max_transform_hierarchy_depth_intra = r.read_ue()?;

        sps.scaling_list_enabled_flag = r.read_bit();
        if sps.scaling_list_enabled_flag {
            // Defaults first; the parsed data overrides them list by list.
            Self::set_default_scaling_list(&mut sps.scaling_list_data);

            sps.sps_scaling_list_data_present_flag = r.read_bit();
            if sps.sps_scaling_list_data_present_flag {
                let chroma_format_idc = sps.chroma_format_idc;
                if let Err(err) =
                    Self::parse_scaling_list(&mut sps.scaling_list_data, chroma_format_idc, &mut r)
                {
                    error!("ill-formed scaling list data, keeping defaults: {:#}", err);
                }
            }
        }

        sps.amp_enabled_flag = r.read_bit();
        sps.sample_adaptive_offset_enabled_flag = r.read_bit();

        sps.pcm_enabled_flag = r.read_bit();
        if sps.pcm_enabled_flag {
            sps.pcm_sample_bit_depth_luma_minus1 = r.read_bits(4)?;
            sps.pcm_sample_bit_depth_chroma_minus1 = r.read_bits(4)?;
            sps.log2_min_pcm_luma_coding_block_size_minus3 = r.read_ue_max(2)?;
            sps.log2_diff_max_min_pcm_luma_coding_block_size = r.read_ue_max(2)?;
            sps.pcm_loop_filter_disabled_flag = r.read_bit();
        }

        sps.num_short_term_ref_pic_sets = r.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS as u32)?;
        for i in 0..u32::from(sps.num_short_term_ref_pic_sets) {
            let mut st = ShortTermRefPicSet::default();
            if let Err(err) = Self::parse_short_term_ref_pic_set(
                &mut st,
                i,
                u32::from(sps.num_short_term_ref_pic_sets),
                &sps.st_rps,
                &mut r,
            ) {
                error!("ill-formed short-term RPS {}, keeping defaults: {:#}", i, err);
            }
            sps.st_rps.push(st);
        }

        sps.long_term_ref_pics_present_flag = r.read_bit();
        if sps.long_term_ref_pics_present_flag {
            sps.num_long_term_ref_pics_sps = r.read_ue_max(MAX_LONG_TERM_REF_PICS as u32)?;
            sps.lt_rps.num_of_pics = u32::from(sps.num_long_term_ref_pics_sps);
            for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                let num_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
                sps.lt_ref_pic_poc_lsb_sps[i] = r.read_bits(num_bits)?;
                sps.used_by_curr_pic_lt_sps_flag[i] = r.read_bit();
                sps.lt_rps.pocs[i] = sps.lt_ref_pic_poc_lsb_sps[i];
                sps.lt_rps.used_by_curr_pic[i] = sps.used_by_curr_pic_lt_sps_flag[i];
            }
        }

        sps.sps_temporal_mvp_enabled_flag = r.read_bit();
        sps.strong_intra_smoothing_enabled_flag = r.read_bit();

        sps.vui_parameters_present_flag = r.read_bit();
        if sps.vui_parameters_present_flag {
            if let Err(err) =
                Self::parse_vui_parameters(&mut sps.vui_parameters, max_sub_layers_minus1, &mut r)
            {
                error!("ill-formed VUI parameters, keeping defaults: {:#}", err);
            }
        }

        sps.sps_extension_flag = r.read_bit();

        Ok(sps)
    }

    fn parse_pps(
        rbsp: &[u8],
        sps_table: &[Option<Box<Sps>>; MAX_SPS_COUNT],
    ) -> anyhow::Result<Pps> {
        let mut r = BitReader::new(rbsp);
        let mut pps = Pps {
            pps_pic_parameter_set_id: r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?,
            pps_seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?,
            ..Default::default()
        };

        // A PPS is only usable once its SPS has been seen.
        let sps = sps_table[usize::from(pps.pps_seq_parameter_set_id)]
            .as_deref()
            .ok_or_else(|| {
                anyhow!(
                    "PPS {} references SPS {} that has not been parsed",
                    pps.pps_pic_parameter_set_id,
                    pps.pps_seq_parameter_set_id
                )
            })?;

        pps.dependent_slice_segments_enabled_flag = r.read_bit();
        pps.output_flag_present_flag = r.read_bit();
        pps.num_extra_slice_header_bits = r.read_bits(3)?;
        pps.sign_data_hiding_enabled_flag = r.read_bit();
        pps.cabac_init_present_flag = r.read_bit();

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE - 1)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE - 1)?;
        pps.init_qp_minus26 = r.read_se()?;

        pps.constrained_intra_pred_flag = r.read_bit();
        pps.transform_skip_enabled_flag = r.read_bit();
        pps.cu_qp_delta_enabled_flag = r.read_bit();
        if pps.cu_qp_delta_enabled_flag {
            pps.diff_cu_qp_delta_depth = r.read_ue()?;
        }

        pps.pps_cb_qp_offset = r.read_se_bounded(-12, 12)?;
        pps.pps_cr_qp_offset = r.read_se_bounded(-12, 12)?;
        pps.pps_slice_chroma_qp_offsets_present_flag = r.read_bit();

        pps.weighted_pred_flag = r.read_bit();
        pps.weighted_bipred_flag = r.read_bit();
        pps.transquant_bypass_enabled_flag = r.read_bit();
        pps.tiles_enabled_flag = r.read_bit();
        pps.entropy_coding_sync_enabled_flag = r.read_bit();

        if pps.tiles_enabled_flag {
            pps.num_tile_columns_minus1 = r.read_ue_max(1022)?;
            pps.num_tile_rows_minus1 = r.read_ue_max(1022)?;
            pps.uniform_spacing_flag = r.read_bit();
            if !pps.uniform_spacing_flag {
                for _ in 0..pps.num_tile_columns_minus1 {
                    pps.column_width_minus1.push(r.read_ue()?);
                }
                for _ in 0..pps.num_tile_rows_minus1 {
                    pps.row_height_minus1.push(r.read_ue()?);
                }
            }
            pps.loop_filter_across_tiles_enabled_flag = r.read_bit();
        } else {
            pps.loop_filter_across_tiles_enabled_flag = true;
            pps.uniform_spacing_flag = true;
        }

        pps.pps_loop_filter_across_slices_enabled_flag = r.read_bit();

        pps.deblocking_filter_control_present_flag = r.read_bit();
        if pps.deblocking_filter_control_present_flag {
            pps.deblocking_filter_override_enabled_flag = r.read_bit();
            pps.pps_deblocking_filter_disabled_flag = r.read_bit();
            if !pps.pps_deblocking_filter_disabled_flag {
                pps.pps_beta_offset_div2 = r.read_se_bounded(-6, 6)?;
                pps.pps_tc_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        pps.pps_scaling_list_data_present_flag = r.read_bit();
        if pps.pps_scaling_list_data_present_flag {
            Self::set_default_scaling_list(&mut pps.scaling_list_data);
            if let Err(err) =
                Self::parse_scaling_list(&mut pps.scaling_list_data, sps.chroma_format_idc, &mut r)
            {
                error!("ill-formed scaling list data, keeping defaults: {:#}", err);
            }
        } else {
            // Inherit the referenced SPS's scaling list by value.
            pps.scaling_list_data = sps.scaling_list_data.clone();
        }

        pps.lists_modification_present_flag = r.read_bit();
        pps.log2_parallel_merge_level_minus2 = r.read_ue()?;
        pps.slice_segment_header_extension_present_flag = r.read_bit();

        pps.pps_extension_present_flag = r.read_bit();
        if pps.pps_extension_present_flag {
            pps.pps_range_extension_flag = r.read_bit();
            pps.pps_multilayer_extension_flag = r.read_bit();
            pps.pps_extension_6bits = r.read_bits(6)?;
        }

        // pps_range_extension()
        if pps.pps_range_extension_flag {
            if pps.transform_skip_enabled_flag {
                pps.log2_max_transform_skip_block_size_minus2 = r.read_ue()?;
            }
            pps.cross_component_prediction_enabled_flag = r.read_bit();
            pps.chroma_qp_offset_list_enabled_flag = r.read_bit();
            if pps.chroma_qp_offset_list_enabled_flag {
                pps.diff_cu_chroma_qp_offset_depth = r.read_ue()?;
                pps.chroma_qp_offset_list_len_minus1 = r.read_ue_max(5)?;
                for i in 0..=usize::from(pps.chroma_qp_offset_list_len_minus1) {
                    pps.cb_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
                    pps.cr_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
                }
            }
            pps.log2_sao_offset_scale_luma = r.read_ue()?;
            pps.log2_sao_offset_scale_chroma = r.read_ue()?;
        }

        Ok(pps)
    }

    fn parse_pred_weight_table(
        hdr: &mut SliceHeader,
        chroma_array_type: u8,
        r: &mut BitReader,
    ) -> anyhow::Result<()> {
        let num_l0 = hdr.num_ref_idx_l0_active_minus1 as usize;
        let num_l1 = hdr.num_ref_idx_l1_active_minus1 as usize;
        let is_b = hdr.slice_type.is_b();
        let pwt = &mut hdr.pred_weight_table;

        pwt.luma_log2_weight_denom = r.read_ue_max(7)?;
        if chroma_array_type != 0 {
            pwt.delta_chroma_log2_weight_denom = r.read_se()?;
        }

        for i in 0..=num_l0 {
            pwt.luma_weight_l0_flag[i] = r.read_bit();
        }
        if chroma_array_type != 0 {
            for i in 0..=num_l0 {
                pwt.chroma_weight_l0_flag[i] = r.read_bit();
            }
        }
        for i in 0..=num_l0 {
            if pwt.luma_weight_l0_flag[i] {
                pwt.delta_luma_weight_l0[i] = r.read_se()?;
                pwt.luma_offset_l0[i] = r.read_se()?;
            }
            if pwt.chroma_weight_l0_flag[i] {
                for j in 0..2 {
                    pwt.delta_chroma_weight_l0[i][j] = r.read_se()?;
                    pwt.delta_chroma_offset_l0[i][j] = r.read_se()?;
                }
            }
        }

        if is_b {
            for i in 0..=num_l1 {
                pwt.luma_weight_l1_flag[i] = r.read_bit();
            }
            if chroma_array_type != 0 {
                for i in 0..=num_l1 {
                    pwt.chroma_weight_l1_flag[i] = r.read_bit();
                }
            }
            for i in 0..=num_l1 {
                if pwt.luma_weight_l1_flag[i] {
                    pwt.delta_luma_weight_l1[i] = r.read_se()?;
                    pwt.luma_offset_l1[i] = r.read_se()?;
                }
                if pwt.chroma_weight_l1_flag[i] {
                    for j in 0..2 {
                        pwt.delta_chroma_weight_l1[i][j] = r.read_se()?;
                        pwt.delta_chroma_offset_l1[i][j] = r.read_se()?;
                    }
                }
            }
        }

        Ok(())
    }

    fn decode_slice_header(&mut self, nalu_type: NaluType, rbsp_len: usize) -> anyhow::Result<()> {
        let rbsp: &[u8] = &self.rbsp_buf[..rbsp_len];
        let mut r = BitReader::new(rbsp);

        let first_slice_segment_in_pic_flag = r.read_bit();
        let no_output_of_prior_pics_flag = if nalu_type.is_irap() { r.read_bit() } else { false };

        let pps_id: u8 = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;

        // Activate the parameter sets referenced by this slice.
        self.active_pps_id = Some(pps_id);
        let pps = self.pps_table[usize::from(pps_id)]
            .as_deref()
            .ok_or_else(|| anyhow!("slice references PPS {} that has not been parsed", pps_id))?;
        if self.active_sps_id != Some(pps.pps_seq_parameter_set_id) {
            self.active_sps_id = Some(pps.pps_seq_parameter_set_id);
            // Cleared again once the sequence callback has run.
            self.new_sps_activated = true;
        }
        let sps = self.sps_table[usize::from(pps.pps_seq_parameter_set_id)]
            .as_deref()
            .ok_or_else(|| {
                anyhow!(
                    "slice's PPS references SPS {} that has not been parsed",
                    pps.pps_seq_parameter_set_id
                )
            })?;
        self.active_vps_id = Some(sps.sps_video_parameter_set_id);

        if self.pic_width != sps.pic_width_in_luma_samples
            || self.pic_height != sps.pic_height_in_luma_samples
        {
            debug!(
                "video dimensions now {}x{}",
                sps.pic_width_in_luma_samples, sps.pic_height_in_luma_samples
            );
            self.pic_width = sps.pic_width_in_luma_samples;
            self.pic_height = sps.pic_height_in_luma_samples;
        }

        // (7-10) .. (7-18)
        let min_cb_log2_size_y = u32::from(sps.log2_min_luma_coding_block_size_minus3) + 3;
        let ctb_log2_size_y =
            min_cb_log2_size_y + u32::from(sps.log2_diff_max_min_luma_coding_block_size);
        let ctb_size_y = 1u32 << ctb_log2_size_y;
        let pic_width_in_ctbs_y = (sps.pic_width_in_luma_samples + ctb_size_y - 1) / ctb_size_y;
        let pic_height_in_ctbs_y = (sps.pic_height_in_luma_samples + ctb_size_y - 1) / ctb_size_y;
        let pic_size_in_ctbs_y = pic_width_in_ctbs_y * pic_height_in_ctbs_y;

        let mut dependent_slice_segment_flag = false;
        let mut slice_segment_address = 0u32;
        if !first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                dependent_slice_segment_flag = r.read_bit();
            }

            let num_bits = ceil_log2(pic_size_in_ctbs_y);
            slice_segment_address = r.read_bits(num_bits)?;
            if slice_segment_address >= pic_size_in_ctbs_y {
                bail!("invalid slice_segment_address {}", slice_segment_address);
            }
        }

        let mut hdr = if dependent_slice_segment_flag {
            self.last_independent_header.clone()
        } else {
            SliceHeader::default()
        };
        hdr.first_slice_segment_in_pic_flag = first_slice_segment_in_pic_flag;
        hdr.no_output_of_prior_pics_flag = no_output_of_prior_pics_flag;
        hdr.slice_pic_parameter_set_id = pps_id;
        hdr.dependent_slice_segment_flag = dependent_slice_segment_flag;
        hdr.slice_segment_address = slice_segment_address;

        let chroma_array_type = if sps.separate_colour_plane_flag {
            0
        } else {
            sps.chroma_format_idc
        };

        if !dependent_slice_segment_flag {
            r.skip_bits(usize::from(pps.num_extra_slice_header_bits));

            let slice_type: u32 = r.read_ue()?;
            hdr.slice_type =
                SliceType::n(slice_type).ok_or(anyhow!("invalid slice type {}", slice_type))?;

            hdr.pic_output_flag = if pps.output_flag_present_flag {
                r.read_bit()
            } else {
                true
            };

            if sps.separate_colour_plane_flag {
                hdr.colour_plane_id = r.read_bits(2)?;
            }

            if nalu_type.is_idr() {
                // 8.3.1: POC starts over at an IDR picture.
                self.poc.curr_poc = 0;
                self.poc.curr_poc_lsb = 0;
                self.poc.curr_poc_msb = 0;
                self.poc.prev_poc = 0;
                self.poc.prev_poc_lsb = 0;
                self.poc.prev_poc_msb = 0;
            } else {
                let num_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
                hdr.slice_pic_order_cnt_lsb = r.read_bits(num_bits)?;

                self.poc.curr_poc_lsb = hdr.slice_pic_order_cnt_lsb as i32;
                self.poc.max_poc_lsb = 1 << num_bits;
                self.poc.curr_poc_msb = if nalu_type.is_bla() {
                    // A broken-link picture restarts the MSB count.
                    0
                } else {
                    derive_poc_msb(
                        self.poc.prev_poc_lsb,
                        self.poc.prev_poc_msb,
                        self.poc.curr_poc_lsb,
                        self.poc.max_poc_lsb,
                    )
                };
                self.poc.curr_poc = self.poc.curr_poc_lsb + self.poc.curr_poc_msb;
                self.poc.prev_poc = self.poc.curr_poc;
                self.poc.prev_poc_lsb = self.poc.curr_poc_lsb;
                self.poc.prev_poc_msb = self.poc.curr_poc_msb;

                hdr.short_term_ref_pic_set_sps_flag = r.read_bit();
                let rps_start = r.position();
                if !hdr.short_term_ref_pic_set_sps_flag {
                    if let Err(err) = Self::parse_short_term_ref_pic_set(
                        &mut hdr.st_rps,
                        u32::from(sps.num_short_term_ref_pic_sets),
                        u32::from(sps.num_short_term_ref_pic_sets),
                        &sps.st_rps,
                        &mut r,
                    ) {
                        error!(
                            "ill-formed short-term RPS in slice header, keeping defaults: {:#}",
                            err
                        );
                    }
                } else if sps.num_short_term_ref_pic_sets > 1 {
                    let num_bits = ceil_log2(u32::from(sps.num_short_term_ref_pic_sets));
                    if num_bits > 0 {
                        hdr.short_term_ref_pic_set_idx = r.read_bits(num_bits)?;
                    }
                    hdr.st_rps = sps
                        .st_rps
                        .get(usize::from(hdr.short_term_ref_pic_set_idx))
                        .ok_or_else(|| {
                            anyhow!(
                                "invalid short_term_ref_pic_set_idx {}",
                                hdr.short_term_ref_pic_set_idx
                            )
                        })?
                        .clone();
                }
                // Needed downstream for entropy alignment.
                hdr.short_term_ref_pic_set_size = (r.position() - rps_start) as u32;

                if sps.long_term_ref_pics_present_flag {
                    if sps.num_long_term_ref_pics_sps > 0 {
                        hdr.num_long_term_sps =
                            r.read_ue_max(u32::from(sps.num_long_term_ref_pics_sps))?;
                    }
                    hdr.num_long_term_pics =
                        r.read_ue_max(MAX_LONG_TERM_REF_PICS as u32 - hdr.num_long_term_sps)?;

                    let bits_for_ltrp_in_sps = ceil_log2(u32::from(sps.num_long_term_ref_pics_sps));
                    let num_lt = hdr.num_long_term_sps + hdr.num_long_term_pics;
                    hdr.lt_rps.num_of_pics = num_lt;
                    for i in 0..num_lt as usize {
                        if i < hdr.num_long_term_sps as usize {
                            if sps.num_long_term_ref_pics_sps > 1 && bits_for_ltrp_in_sps > 0 {
                                hdr.lt_idx_sps[i] = r.read_bits(bits_for_ltrp_in_sps)?;
                                let idx = hdr.lt_idx_sps[i] as usize;
                                if idx >= usize::from(sps.num_long_term_ref_pics_sps) {
                                    bail!("invalid lt_idx_sps[{}] {}", i, idx);
                                }
                                // PocLsbLt[], UsedByCurrPicLt[]
                                hdr.lt_rps.pocs[i] = sps.lt_rps.pocs[idx];
                                hdr.lt_rps.used_by_curr_pic[i] = sps.lt_rps.used_by_curr_pic[idx];
                            }
                        } else {
                            let num_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
                            hdr.poc_lsb_lt[i] = r.read_bits(num_bits)?;
                            hdr.used_by_curr_pic_lt_flag[i] = r.read_bit();
                            hdr.lt_rps.pocs[i] = hdr.poc_lsb_lt[i];
                            hdr.lt_rps.used_by_curr_pic[i] = hdr.used_by_curr_pic_lt_flag[i];
                        }
                        hdr.delta_poc_msb_present_flag[i] = r.read_bit();
                        if hdr.delta_poc_msb_present_flag[i] {
                            hdr.delta_poc_msb_cycle_lt[i] = r.read_ue()?;
                        }
                    }
                }

                if sps.sps_temporal_mvp_enabled_flag {
                    hdr.slice_temporal_mvp_enabled_flag = r.read_bit();
                }
            }

            if sps.sample_adaptive_offset_enabled_flag {
                hdr.slice_sao_luma_flag = r.read_bit();
                if chroma_array_type != 0 {
                    hdr.slice_sao_chroma_flag = r.read_bit();
                }
            }

            if hdr.slice_type.is_p() || hdr.slice_type.is_b() {
                hdr.num_ref_idx_active_override_flag = r.read_bit();
                if hdr.num_ref_idx_active_override_flag {
                    hdr.num_ref_idx_l0_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE - 1)?;
                    if hdr.slice_type.is_b() {
                        hdr.num_ref_idx_l1_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE - 1)?;
                    }
                } else {
                    hdr.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                    if hdr.slice_type.is_b() {
                        hdr.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                    }
                }

                // (7-57): NumPicTotalCurr over the combined short-term and
                // long-term lists.
                let mut num_pic_total_curr = 0u32;
                for i in 0..hdr.st_rps.num_of_delta_poc as usize {
                    if hdr.st_rps.used_by_curr_pic[i] {
                        num_pic_total_curr += 1;
                    }
                }
                for i in 0..hdr.lt_rps.num_of_pics as usize {
                    if hdr.lt_rps.used_by_curr_pic[i] {
                        num_pic_total_curr += 1;
                    }
                }

                // 7.3.6.2 ref_pic_lists_modification()
                if pps.lists_modification_present_flag && num_pic_total_curr > 1 {
                    let list_entry_bits = ceil_log2(num_pic_total_curr);

                    hdr.ref_pic_list_modification_flag_l0 = r.read_bit();
                    if hdr.ref_pic_list_modification_flag_l0 {
                        for i in 0..hdr.num_ref_idx_l0_active_minus1 as usize {
                            hdr.list_entry_l0[i] = r.read_bits(list_entry_bits)?;
                        }
                    }

                    if hdr.slice_type.is_b() {
                        hdr.ref_pic_list_modification_flag_l1 = r.read_bit();
                        if hdr.ref_pic_list_modification_flag_l1 {
                            for i in 0..hdr.num_ref_idx_l1_active_minus1 as usize {
                                hdr.list_entry_l1[i] = r.read_bits(list_entry_bits)?;
                            }
                        }
                    }
                }

                if hdr.slice_type.is_b() {
                    hdr.mvd_l1_zero_flag = r.read_bit();
                }
                if pps.cabac_init_present_flag {
                    hdr.cabac_init_flag = r.read_bit();
                }

                if hdr.slice_temporal_mvp_enabled_flag {
                    // Inferred to 1 when not present (P slices).
                    hdr.collocated_from_l0_flag = if hdr.slice_type.is_b() {
                        r.read_bit()
                    } else {
                        true
                    };
                    if (hdr.collocated_from_l0_flag && hdr.num_ref_idx_l0_active_minus1 > 0)
                        || (!hdr.collocated_from_l0_flag && hdr.num_ref_idx_l1_active_minus1 > 0)
                    {
                        hdr.collocated_ref_idx = r.read_ue()?;
                    }
                }

                if (pps.weighted_pred_flag && hdr.slice_type.is_p())
                    || (pps.weighted_bipred_flag && hdr.slice_type.is_b())
                {
                    Self::parse_pred_weight_table(&mut hdr, chroma_array_type, &mut r)?;
                }

                hdr.five_minus_max_num_merge_cand = r.read_ue()?;
            }

            hdr.slice_qp_delta = r.read_se()?;
            if pps.pps_slice_chroma_qp_offsets_present_flag {
                hdr.slice_cb_qp_offset = r.read_se()?;
                hdr.slice_cr_qp_offset = r.read_se()?;
            }
            if pps.chroma_qp_offset_list_enabled_flag {
                hdr.cu_chroma_qp_offset_enabled_flag = r.read_bit();
            }

            if pps.deblocking_filter_override_enabled_flag {
                hdr.deblocking_filter_override_flag = r.read_bit();
            }
            if hdr.deblocking_filter_override_flag {
                hdr.slice_deblocking_filter_disabled_flag = r.read_bit();
                if !hdr.slice_deblocking_filter_disabled_flag {
                    hdr.slice_beta_offset_div2 = r.read_se()?;
                    hdr.slice_tc_offset_div2 = r.read_se()?;
                }
            }

            if pps.pps_loop_filter_across_slices_enabled_flag
                && (hdr.slice_sao_luma_flag
                    || hdr.slice_sao_chroma_flag
                    || !hdr.slice_deblocking_filter_disabled_flag)
            {
                hdr.slice_loop_filter_across_slices_enabled_flag = r.read_bit();
            }

            // The snapshot feeding dependent slice segments is taken before
            // the entry-point block.
            self.last_independent_header = hdr.clone();
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            let max = if !pps.tiles_enabled_flag {
                pic_height_in_ctbs_y - 1
            } else if !pps.entropy_coding_sync_enabled_flag {
                (pps.num_tile_columns_minus1 + 1) * (pps.num_tile_rows_minus1 + 1) - 1
            } else {
                (pps.num_tile_columns_minus1 + 1) * pic_height_in_ctbs_y - 1
            };

            hdr.num_entry_point_offsets = r.read_ue_max(max)?;
            if hdr.num_entry_point_offsets > 0 {
                hdr.offset_len_minus1 = r.read_ue_max(31)?;
                for _ in 0..hdr.num_entry_point_offsets {
                    let num_bits = (hdr.offset_len_minus1 + 1) as usize;
                    hdr.entry_point_offset_minus1.push(r.read_bits(num_bits)?);
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            hdr.slice_segment_header_extension_length = r.read_ue_max(256)?;
            for _ in 0..hdr.slice_segment_header_extension_length {
                hdr.slice_segment_header_extension_data.push(r.read_bits(8)?);
            }
        }

        if first_slice_segment_in_pic_flag {
            self.new_picture = true;
        }

        self.slice_header = hdr;

        Ok(())
    }

    /// Builds the sequence summary from the active SPS.
    fn active_video_format(&self) -> ParserResult<VideoFormat> {
        let sps = self
            .active_sps_id
            .and_then(|id| self.sps_table[usize::from(id)].as_deref())
            .ok_or_else(|| ParserError::InvalidFormat(anyhow!("no active SPS")))?;

        let chroma_format = ChromaFormat::n(sps.chroma_format_idc).ok_or_else(|| {
            ParserError::NotSupported(format!("chroma_format_idc {}", sps.chroma_format_idc))
        })?;

        let ptl = &sps.profile_tier_level;
        let progressive_sequence = if ptl.general_progressive_source_flag
            && !ptl.general_interlaced_source_flag
        {
            true
        } else if !ptl.general_progressive_source_flag && ptl.general_interlaced_source_flag {
            false
        } else {
            // Unknown or signalled per picture; assume progressive.
            true
        };

        let (sub_width_c, sub_height_c) = chroma_format.sub_sampling();
        let display_area = if sps.conformance_window_flag {
            Rect {
                left: sub_width_c * sps.conf_win_left_offset,
                top: sub_height_c * sps.conf_win_top_offset,
                right: sps
                    .pic_width_in_luma_samples
                    .saturating_sub(sub_width_c * sps.conf_win_right_offset),
                bottom: sps
                    .pic_height_in_luma_samples
                    .saturating_sub(sub_height_c * sps.conf_win_bottom_offset),
            }
        } else {
            Rect {
                left: 0,
                top: 0,
                right: sps.pic_width_in_luma_samples,
                bottom: sps.pic_height_in_luma_samples,
            }
        };

        let vui = &sps.vui_parameters;
        let frame_rate = if sps.vui_parameters_present_flag
            && vui.vui_timing_info_present_flag
            && vui.vui_num_units_in_tick != 0
        {
            Rational {
                numerator: vui.vui_time_scale,
                denominator: vui.vui_num_units_in_tick,
            }
        } else {
            Rational::default()
        };

        let display_aspect_ratio =
            if sps.vui_parameters_present_flag && vui.aspect_ratio_info_present_flag {
                AspectRatio {
                    x: vui.sar_width,
                    y: vui.sar_height,
                }
            } else {
                AspectRatio::default()
            };

        let video_signal_description = if sps.vui_parameters_present_flag {
            VideoSignalDescription {
                video_format: vui.video_format,
                video_full_range_flag: vui.video_full_range_flag,
                colour_primaries: vui.colour_primaries,
                transfer_characteristics: vui.transfer_characteristics,
                matrix_coefficients: vui.matrix_coeffs,
            }
        } else {
            VideoSignalDescription::default()
        };

        Ok(VideoFormat {
            codec: Codec::Hevc,
            frame_rate,
            bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
            progressive_sequence,
            min_num_decode_surfaces: sps.sps_max_dec_pic_buffering_minus1[0] + 1,
            coded_width: sps.pic_width_in_luma_samples,
            coded_height: sps.pic_height_in_luma_samples,
            chroma_format,
            display_area,
            bitrate: 0,
            display_aspect_ratio,
            video_signal_description,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::nalu::NaluType;
    use crate::ParserError;

    // Composes bit-exact RBSP payloads for synthesized test streams, the
    // counterpart of the parser's bit reader.
    struct StreamWriter {
        out: Vec<u8>,
        curr_byte: u8,
        nth_bit: u8,
    }

    impl StreamWriter {
        fn new() -> Self {
            Self {
                out: Vec::new(),
                curr_byte: 0,
                nth_bit: 0,
            }
        }

        fn bit(&mut self, bit: bool) {
            self.curr_byte |= (bit as u8) << (7 - self.nth_bit);
            self.nth_bit += 1;
            if self.nth_bit == 8 {
                self.out.push(self.curr_byte);
                self.curr_byte = 0;
                self.nth_bit = 0;
            }
        }

        fn f(&mut self, bits: usize, value: u32) {
            for bit in (0..bits).rev() {
                self.bit((value >> bit) & 1 != 0);
            }
        }

        fn ue(&mut self, value: u32) {
            let code = u64::from(value) + 1;
            let len = 64 - code.leading_zeros() as usize;
            self.f(len - 1, 0);
            for bit in (0..len).rev() {
                self.bit((code >> bit) & 1 != 0);
            }
        }

        fn se(&mut self, value: i32) {
            let code = if value <= 0 {
                (-value as u32) * 2
            } else {
                value as u32 * 2 - 1
            };
            self.ue(code);
        }

        // rbsp_trailing_bits(): stop bit plus alignment zeros.
        fn finish(mut self) -> Vec<u8> {
            self.bit(true);
            while self.nth_bit != 0 {
                self.bit(false);
            }
            self.out
        }
    }

    // Annex B encapsulation: start code, NAL unit header, payload with
    // emulation prevention applied.
    fn annex_b_nalu(nalu_type: NaluType, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01];
        out.push((nalu_type as u8) << 1);
        out.push(0x01); // nuh_layer_id 0, nuh_temporal_id_plus1 1

        let mut num_zeros = 0;
        for &byte in payload {
            if num_zeros == 2 && byte <= 0x03 {
                out.push(0x03);
                num_zeros = 0;
            }
            out.push(byte);
            num_zeros = if byte == 0x00 { num_zeros + 1 } else { 0 };
        }
        out
    }

    // Minimal profile_tier_level(): Main profile, compatibility flag 1,
    // progressive source.
    fn write_ptl(w: &mut StreamWriter, level_idc: u32) {
        w.f(2, 0); // general_profile_space
        w.bit(false); // general_tier_flag
        w.f(5, 1); // general_profile_idc
        w.f(32, 0x4000_0000); // general_profile_compatibility_flag[1]
        w.bit(true); // general_progressive_source_flag
        w.bit(false); // general_interlaced_source_flag
        w.bit(false); // general_non_packed_constraint_flag
        w.bit(true); // general_frame_only_constraint_flag
        w.f(32, 0); // general_reserved_zero_44bits
        w.f(12, 0);
        w.f(8, level_idc); // general_level_idc
    }

    fn vps_rbsp() -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.f(4, 0); // vps_video_parameter_set_id
        w.bit(true); // vps_base_layer_internal_flag
        w.bit(true); // vps_base_layer_available_flag
        w.f(6, 0); // vps_max_layers_minus1
        w.f(3, 0); // vps_max_sub_layers_minus1
        w.bit(true); // vps_temporal_id_nesting_flag
        w.f(16, 0xffff); // vps_reserved_0xffff_16bits
        write_ptl(&mut w, 120);
        w.bit(true); // vps_sub_layer_ordering_info_present_flag
        w.ue(5); // vps_max_dec_pic_buffering_minus1[0]
        w.ue(0); // vps_max_num_reorder_pics[0]
        w.ue(0); // vps_max_latency_increase_plus1[0]
        w.f(6, 0); // vps_max_layer_id
        w.ue(0); // vps_num_layer_sets_minus1
        w.bit(false); // vps_timing_info_present_flag
        w.bit(false); // vps_extension_flag
        w.finish()
    }

    struct SpsParams {
        width: u32,
        height: u32,
        conf_window: Option<(u32, u32, u32, u32)>,
        log2_max_poc_lsb_minus4: u32,
        dpb_minus1: u32,
        reorder: u32,
        scaling_list_enabled: bool,
        /// Emit a scaling list whose first pred_matrix_id_delta is out of
        /// range, after which the stream continues in sync.
        malformed_scaling_list: bool,
        /// Emit a VUI whose chroma_sample_loc_type_top_field is out of range.
        malformed_vui: bool,
    }

    impl Default for SpsParams {
        fn default() -> Self {
            Self {
                width: 1920,
                height: 1088,
                conf_window: None,
                log2_max_poc_lsb_minus4: 4,
                dpb_minus1: 4,
                reorder: 2,
                scaling_list_enabled: false,
                malformed_scaling_list: false,
                malformed_vui: false,
            }
        }
    }

    fn sps_rbsp(p: &SpsParams) -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.f(4, 0); // sps_video_parameter_set_id
        w.f(3, 0); // sps_max_sub_layers_minus1
        w.bit(true); // sps_temporal_id_nesting_flag
        write_ptl(&mut w, 120);
        w.ue(0); // sps_seq_parameter_set_id
        w.ue(1); // chroma_format_idc: 4:2:0
        w.ue(p.width);
        w.ue(p.height);
        match p.conf_window {
            Some((left, right, top, bottom)) => {
                w.bit(true);
                w.ue(left);
                w.ue(right);
                w.ue(top);
                w.ue(bottom);
            }
            None => w.bit(false),
        }
        w.ue(0); // bit_depth_luma_minus8
        w.ue(0); // bit_depth_chroma_minus8
        w.ue(p.log2_max_poc_lsb_minus4);
        w.bit(true); // sps_sub_layer_ordering_info_present_flag
        w.ue(p.dpb_minus1);
        w.ue(p.reorder);
        w.ue(0); // sps_max_latency_increase_plus1[0]
        w.ue(0); // log2_min_luma_coding_block_size_minus3: 8
        w.ue(2); // log2_diff_max_min_luma_coding_block_size: CTB 32
        w.ue(0); // log2_min_transform_block_size_minus2
        w.ue(3); // log2_diff_max_min_transform_block_size
        w.ue(0); // max_transform_hierarchy_depth_inter
        w.ue(0); // max_transform_hierarchy_depth_intra
        if p.malformed_scaling_list {
            w.bit(true); // scaling_list_enabled_flag
            w.bit(true); // sps_scaling_list_data_present_flag
            w.bit(false); // scaling_list_pred_mode_flag[0][0]
            w.ue(7); // scaling_list_pred_matrix_id_delta, out of range
        } else if p.scaling_list_enabled {
            w.bit(true); // scaling_list_enabled_flag
            w.bit(false); // sps_scaling_list_data_present_flag
        } else {
            w.bit(false);
        }
        w.bit(false); // amp_enabled_flag
        w.bit(false); // sample_adaptive_offset_enabled_flag
        w.bit(false); // pcm_enabled_flag
        w.ue(0); // num_short_term_ref_pic_sets
        w.bit(false); // long_term_ref_pics_present_flag
        w.bit(false); // sps_temporal_mvp_enabled_flag
        w.bit(false); // strong_intra_smoothing_enabled_flag
        if p.malformed_vui {
            w.bit(true); // vui_parameters_present_flag
            w.bit(false); // aspect_ratio_info_present_flag
            w.bit(false); // overscan_info_present_flag
            w.bit(false); // video_signal_type_present_flag
            w.bit(true); // chroma_loc_info_present_flag
            w.ue(7); // chroma_sample_loc_type_top_field, out of range
        } else {
            w.bit(false); // vui_parameters_present_flag
        }
        w.bit(false); // sps_extension_flag
        w.finish()
    }

    fn pps_rbsp(dependent_slices: bool, l0_default_minus1: u32) -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.ue(0); // pps_pic_parameter_set_id
        w.ue(0); // pps_seq_parameter_set_id
        w.bit(dependent_slices); // dependent_slice_segments_enabled_flag
        w.bit(false); // output_flag_present_flag
        w.f(3, 0); // num_extra_slice_header_bits
        w.bit(false); // sign_data_hiding_enabled_flag
        w.bit(false); // cabac_init_present_flag
        w.ue(l0_default_minus1); // num_ref_idx_l0_default_active_minus1
        w.ue(0); // num_ref_idx_l1_default_active_minus1
        w.se(0); // init_qp_minus26
        w.bit(false); // constrained_intra_pred_flag
        w.bit(false); // transform_skip_enabled_flag
        w.bit(false); // cu_qp_delta_enabled_flag
        w.se(0); // pps_cb_qp_offset
        w.se(0); // pps_cr_qp_offset
        w.bit(false); // pps_slice_chroma_qp_offsets_present_flag
        w.bit(false); // weighted_pred_flag
        w.bit(false); // weighted_bipred_flag
        w.bit(false); // transquant_bypass_enabled_flag
        w.bit(false); // tiles_enabled_flag
        w.bit(false); // entropy_coding_sync_enabled_flag
        w.bit(false); // pps_loop_filter_across_slices_enabled_flag
        w.bit(false); // deblocking_filter_control_present_flag
        w.bit(false); // pps_scaling_list_data_present_flag
        w.bit(false); // lists_modification_present_flag
        w.ue(0); // log2_parallel_merge_level_minus2
        w.bit(false); // slice_segment_header_extension_present_flag
        w.bit(false); // pps_extension_present_flag
        w.finish()
    }

    fn idr_slice_rbsp() -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.bit(true); // first_slice_segment_in_pic_flag
        w.bit(false); // no_output_of_prior_pics_flag
        w.ue(0); // slice_pic_parameter_set_id
        w.ue(2); // slice_type: I
        w.se(0); // slice_qp_delta
        w.finish()
    }

    // An independent P slice with a one-picture inline short-term RPS.
    fn trail_slice_rbsp(poc_lsb: u32, poc_bits: usize, qp_delta: i32) -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.bit(true); // first_slice_segment_in_pic_flag
        w.ue(0); // slice_pic_parameter_set_id
        w.ue(1); // slice_type: P
        w.f(poc_bits, poc_lsb); // slice_pic_order_cnt_lsb
        w.bit(false); // short_term_ref_pic_set_sps_flag -> inline RPS
        w.ue(1); // num_negative_pics
        w.ue(0); // num_positive_pics
        w.ue(0); // delta_poc_s0_minus1[0]
        w.bit(true); // used_by_curr_pic_s0_flag[0]
        w.bit(false); // num_ref_idx_active_override_flag
        w.ue(0); // five_minus_max_num_merge_cand
        w.se(qp_delta); // slice_qp_delta
        w.finish()
    }

    // An I slice for IRAP types other than IDR (BLA/CRA), which still carry
    // slice_pic_order_cnt_lsb.
    fn irap_slice_rbsp(poc_lsb: u32, poc_bits: usize) -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.bit(true); // first_slice_segment_in_pic_flag
        w.bit(false); // no_output_of_prior_pics_flag
        w.ue(0); // slice_pic_parameter_set_id
        w.ue(2); // slice_type: I
        w.f(poc_bits, poc_lsb); // slice_pic_order_cnt_lsb
        w.bit(false); // short_term_ref_pic_set_sps_flag -> inline RPS
        w.ue(0); // num_negative_pics
        w.ue(0); // num_positive_pics
        w.se(0); // slice_qp_delta
        w.finish()
    }

    fn dependent_slice_rbsp(address: u32, addr_bits: usize) -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.bit(false); // first_slice_segment_in_pic_flag
        w.ue(0); // slice_pic_parameter_set_id
        w.bit(true); // dependent_slice_segment_flag
        w.f(addr_bits, address); // slice_segment_address
        w.finish()
    }

    fn setup_packet(sps: &SpsParams, dependent_slices: bool, l0_default_minus1: u32) -> Vec<u8> {
        let mut packet = annex_b_nalu(NaluType::VpsNut, &vps_rbsp());
        packet.extend(annex_b_nalu(NaluType::SpsNut, &sps_rbsp(sps)));
        packet.extend(annex_b_nalu(
            NaluType::PpsNut,
            &pps_rbsp(dependent_slices, l0_default_minus1),
        ));
        packet
    }

    #[test]
    fn parse_minimal_vps() {
        let _ = env_logger::try_init();

        let mut parser = Parser::new();
        parser
            .parse_video_data(&annex_b_nalu(NaluType::VpsNut, &vps_rbsp()))
            .unwrap();

        let vps = parser.get_vps(0).unwrap();
        assert!(vps.vps_base_layer_internal_flag);
        assert!(vps.vps_base_layer_available_flag);
        assert_eq!(vps.vps_max_layers_minus1, 0);
        assert_eq!(vps.vps_max_sub_layers_minus1, 0);
        assert!(vps.vps_temporal_id_nesting_flag);
        assert_eq!(vps.profile_tier_level.general_profile_idc, 1);
        assert!(vps.profile_tier_level.general_profile_compatibility_flag[1]);
        assert!(vps.profile_tier_level.general_progressive_source_flag);
        assert_eq!(vps.profile_tier_level.general_level_idc, 120);
        assert_eq!(vps.vps_max_dec_pic_buffering_minus1[0], 5);
        assert_eq!(vps.vps_max_layer_id, 0);
        assert_eq!(vps.vps_num_layer_sets_minus1, 0);
        assert!(!vps.vps_timing_info_present_flag);
        assert!(!vps.vps_extension_flag);
    }

    #[test]
    fn sequence_callback_reports_conformance_window() {
        let _ = env_logger::try_init();

        let sps = SpsParams {
            conf_window: Some((0, 0, 0, 4)),
            ..Default::default()
        };
        let mut packet = setup_packet(&sps, false, 0);
        packet.extend(annex_b_nalu(NaluType::IdrWRadl, &idr_slice_rbsp()));

        let formats = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&formats);

        let mut parser = Parser::new();
        parser.set_sequence_callback(move |format: &VideoFormat| {
            sink.borrow_mut().push(format.clone());
        });
        parser.parse_video_data(&packet).unwrap();

        assert_eq!(formats.borrow().len(), 1);
        let format = formats.borrow()[0].clone();
        assert_eq!(format.codec, Codec::Hevc);
        assert_eq!(format.coded_width, 1920);
        assert_eq!(format.coded_height, 1088);
        assert_eq!(format.chroma_format, ChromaFormat::Yuv420);
        // SubWidthC/SubHeightC are 2 for 4:2:0, so the bottom offset of 4
        // crops 8 luma rows.
        assert_eq!(
            format.display_area,
            Rect {
                left: 0,
                top: 0,
                right: 1920,
                bottom: 1080
            }
        );
        assert_eq!(format.min_num_decode_surfaces, 5);
        assert!(format.progressive_sequence);
        assert_eq!(format.bit_depth_luma_minus8, 0);
        assert_eq!(format.bit_depth_chroma_minus8, 0);
        assert_eq!(format.frame_rate, Rational::default());

        // Another picture under the same SPS must not re-activate.
        let slice = annex_b_nalu(NaluType::TrailR, &trail_slice_rbsp(10, 8, 0));
        parser.parse_video_data(&slice).unwrap();
        assert_eq!(formats.borrow().len(), 1);
    }

    #[test]
    fn display_area_defaults_to_coded_frame() {
        let _ = env_logger::try_init();

        let mut packet = setup_packet(&SpsParams::default(), false, 0);
        packet.extend(annex_b_nalu(NaluType::IdrWRadl, &idr_slice_rbsp()));

        let formats = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&formats);

        let mut parser = Parser::new();
        parser.set_sequence_callback(move |format: &VideoFormat| {
            sink.borrow_mut().push(format.clone());
        });
        parser.parse_video_data(&packet).unwrap();

        assert_eq!(
            formats.borrow()[0].display_area,
            Rect {
                left: 0,
                top: 0,
                right: 1920,
                bottom: 1088
            }
        );
    }

    #[test]
    fn poc_derivation_wraps_and_resets() {
        let _ = env_logger::try_init();

        let mut packet = setup_packet(&SpsParams::default(), false, 0);
        packet.extend(annex_b_nalu(NaluType::IdrWRadl, &idr_slice_rbsp()));

        let mut parser = Parser::new();
        parser.parse_video_data(&packet).unwrap();
        assert_eq!(parser.poc().curr_poc, 0);

        // log2_max_pic_order_cnt_lsb_minus4 = 4, so lsb is 8 bits and
        // MaxPicOrderCntLsb is 256. The jump from 252 down to 4 wraps the
        // MSB up; the jump from 4 up to 250 wraps it back down.
        for (lsb, expected_poc) in [(100, 100), (200, 200), (252, 252), (4, 260), (250, 250)] {
            let slice = annex_b_nalu(NaluType::TrailR, &trail_slice_rbsp(lsb, 8, 0));
            parser.parse_video_data(&slice).unwrap();
            assert_eq!(parser.poc().curr_poc, expected_poc, "lsb {}", lsb);
        }

        // A broken-link picture forces the MSB to zero.
        let bla = annex_b_nalu(NaluType::BlaWLp, &irap_slice_rbsp(10, 8));
        parser.parse_video_data(&bla).unwrap();
        assert_eq!(parser.poc().curr_poc, 10);

        // A CRA is not a BLA: the regular derivation applies.
        let cra = annex_b_nalu(NaluType::CraNut, &irap_slice_rbsp(20, 8));
        parser.parse_video_data(&cra).unwrap();
        assert_eq!(parser.poc().curr_poc, 20);

        // An IDR resets everything.
        let idr = annex_b_nalu(NaluType::IdrNLp, &idr_slice_rbsp());
        parser.parse_video_data(&idr).unwrap();
        assert_eq!(parser.poc().curr_poc, 0);
        assert_eq!(parser.poc().prev_poc_lsb, 0);
        assert_eq!(parser.poc().prev_poc_msb, 0);
    }

    #[test]
    fn poc_msb_rule() {
        // No wrap while the lsb moves less than half the range.
        assert_eq!(derive_poc_msb(100, 0, 150, 256), 0);
        // Wrap up: lsb dropped by at least half the range.
        assert_eq!(derive_poc_msb(255, 0, 1, 256), 256);
        // Wrap down: lsb grew by more than half the range.
        assert_eq!(derive_poc_msb(0, 256, 255, 256), 0);
        // A growth of exactly half the range is not a wrap.
        assert_eq!(derive_poc_msb(0, 256, 128, 256), 256);
    }

    #[test]
    fn dependent_slice_inherits_independent_fields() {
        let _ = env_logger::try_init();

        let mut packet = setup_packet(&SpsParams::default(), true, 2);
        packet.extend(annex_b_nalu(NaluType::TrailR, &trail_slice_rbsp(10, 8, -3)));

        let mut parser = Parser::new();
        parser.parse_video_data(&packet).unwrap();

        let header = parser.slice_header();
        assert!(header.first_slice_segment_in_pic_flag);
        assert!(!header.dependent_slice_segment_flag);
        assert_eq!(header.slice_type, SliceType::P);
        assert_eq!(header.num_ref_idx_l0_active_minus1, 2);
        assert_eq!(header.slice_qp_delta, -3);
        assert!(parser.is_new_picture());
        assert_eq!(parser.active_pps_id(), Some(0));
        assert_eq!(parser.active_sps_id(), Some(0));
        assert_eq!(parser.active_vps_id(), Some(0));

        // 1920x1088 with a 32x32 CTB is 60x34 CTBs, so the segment address
        // takes ceil(log2(2040)) = 11 bits.
        let dependent = annex_b_nalu(NaluType::TrailR, &dependent_slice_rbsp(42, 11));
        parser.parse_video_data(&dependent).unwrap();

        let header = parser.slice_header();
        assert!(!header.first_slice_segment_in_pic_flag);
        assert!(header.dependent_slice_segment_flag);
        assert_eq!(header.slice_segment_address, 42);
        // Everything else is inherited from the independent slice.
        assert_eq!(header.slice_type, SliceType::P);
        assert_eq!(header.num_ref_idx_l0_active_minus1, 2);
        assert_eq!(header.slice_qp_delta, -3);
        assert_eq!(header.st_rps.num_negative_pics, 1);
        assert!(!parser.is_new_picture());
        // The POC belongs to the same picture.
        assert_eq!(parser.poc().curr_poc, 10);
    }

    #[test]
    fn missing_start_code_is_an_error() {
        let _ = env_logger::try_init();

        let mut parser = Parser::new();
        assert!(matches!(
            parser.parse_video_data(&[0x11, 0x22, 0x33, 0x44]),
            Err(ParserError::NotFound)
        ));
        assert!(matches!(
            parser.parse_video_data(&[]),
            Err(ParserError::NotFound)
        ));
    }

    #[test]
    fn slice_without_pps_is_an_error() {
        let _ = env_logger::try_init();

        let mut parser = Parser::new();
        let slice = annex_b_nalu(NaluType::TrailR, &trail_slice_rbsp(10, 8, 0));
        assert!(matches!(
            parser.parse_video_data(&slice),
            Err(ParserError::InvalidFormat(_))
        ));
    }

    #[test]
    fn pps_without_sps_is_an_error() {
        let _ = env_logger::try_init();

        let mut parser = Parser::new();
        let pps = annex_b_nalu(NaluType::PpsNut, &pps_rbsp(false, 0));
        assert!(matches!(
            parser.parse_video_data(&pps),
            Err(ParserError::InvalidFormat(_))
        ));
    }

    #[test]
    fn broken_emulation_prevention_is_an_error() {
        let _ = env_logger::try_init();

        let mut parser = Parser::new();
        // 0x000003 followed by a byte greater than 0x03.
        let packet = [0x00, 0x00, 0x01, 0x40, 0x01, 0x00, 0x00, 0x03, 0x05, 0x17];
        assert!(matches!(
            parser.parse_video_data(&packet),
            Err(ParserError::InvalidFormat(_))
        ));
    }

    #[test]
    fn non_slice_nalu_types_are_skipped() {
        let _ = env_logger::try_init();

        let mut packet = annex_b_nalu(NaluType::AudNut, &[0x80]);
        packet.extend(annex_b_nalu(NaluType::PrefixSeiNut, &[0x01, 0x02, 0x80]));

        let mut parser = Parser::new();
        parser.parse_video_data(&packet).unwrap();
        assert!(parser.get_vps(0).is_none());
    }

    #[test]
    fn scaling_lists_default_when_enabled_but_absent() {
        let _ = env_logger::try_init();

        let sps_params = SpsParams {
            scaling_list_enabled: true,
            ..Default::default()
        };
        let packet = setup_packet(&sps_params, false, 0);

        let mut parser = Parser::new();
        parser.parse_video_data(&packet).unwrap();

        let sps = parser.get_sps(0).unwrap();
        assert!(sps.scaling_list_enabled_flag);
        assert!(!sps.sps_scaling_list_data_present_flag);
        let sl = &sps.scaling_list_data;
        assert_eq!(&sl.scaling_list[0][0][..16], &DEFAULT_SCALING_LIST_4X4);
        assert_eq!(sl.scaling_list[1][0], DEFAULT_SCALING_LIST_INTRA);
        assert_eq!(sl.scaling_list[2][4], DEFAULT_SCALING_LIST_INTER);
        assert_eq!(sl.scaling_list_dc_coef[0][0], 16);
        assert_eq!(sl.scaling_list_dc_coef[1][5], 16);

        // The PPS carries no list of its own and inherits the SPS's.
        let pps = parser.get_pps(0).unwrap();
        assert_eq!(pps.scaling_list_data, sps.scaling_list_data);
    }

    #[test]
    fn parameter_sets_are_replaced_by_id() {
        let _ = env_logger::try_init();

        let mut parser = Parser::new();
        let packet = setup_packet(&SpsParams::default(), false, 0);
        parser.parse_video_data(&packet).unwrap();
        assert_eq!(parser.get_sps(0).unwrap().pic_width_in_luma_samples, 1920);

        let smaller = SpsParams {
            width: 640,
            height: 480,
            ..Default::default()
        };
        let packet = annex_b_nalu(NaluType::SpsNut, &sps_rbsp(&smaller));
        parser.parse_video_data(&packet).unwrap();
        assert_eq!(parser.get_sps(0).unwrap().pic_width_in_luma_samples, 640);
    }

    #[test]
    fn ctb_sizing_is_derived() {
        let _ = env_logger::try_init();

        let packet = setup_packet(&SpsParams::default(), false, 0);
        let mut parser = Parser::new();
        parser.parse_video_data(&packet).unwrap();

        let sps = parser.get_sps(0).unwrap();
        assert_eq!(sps.max_cu_width, 32);
        assert_eq!(sps.max_cu_height, 32);
        assert_eq!(sps.max_cu_depth, 3);
    }

    // An I slice whose inline short-term RPS signals an impossible picture
    // count, with the stream continuing in sync after the bad code.
    fn malformed_rps_slice_rbsp(poc_lsb: u32, poc_bits: usize) -> Vec<u8> {
        let mut w = StreamWriter::new();
        w.bit(true); // first_slice_segment_in_pic_flag
        w.ue(0); // slice_pic_parameter_set_id
        w.ue(2); // slice_type: I
        w.f(poc_bits, poc_lsb); // slice_pic_order_cnt_lsb
        w.bit(false); // short_term_ref_pic_set_sps_flag -> inline RPS
        w.ue(20); // num_negative_pics, out of range
        w.se(0); // slice_qp_delta
        w.finish()
    }

    #[test]
    fn malformed_vui_degrades_without_aborting_the_packet() {
        let _ = env_logger::try_init();

        let sps_params = SpsParams {
            malformed_vui: true,
            ..Default::default()
        };
        let mut packet = setup_packet(&sps_params, false, 0);
        packet.extend(annex_b_nalu(NaluType::IdrWRadl, &idr_slice_rbsp()));

        let formats = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&formats);

        let mut parser = Parser::new();
        parser.set_sequence_callback(move |format: &VideoFormat| {
            sink.borrow_mut().push(format.clone());
        });
        parser.parse_video_data(&packet).unwrap();

        // The bad chroma-loc field keeps its default; everything after the
        // VUI, including the PPS and the slice in the same packet, parsed.
        let sps = parser.get_sps(0).unwrap();
        assert!(sps.vui_parameters_present_flag);
        assert!(sps.vui_parameters.chroma_loc_info_present_flag);
        assert_eq!(sps.vui_parameters.chroma_sample_loc_type_top_field, 0);
        assert!(parser.get_pps(0).is_some());
        assert_eq!(parser.poc().curr_poc, 0);
        assert_eq!(formats.borrow().len(), 1);
    }

    #[test]
    fn malformed_scaling_list_keeps_defaults() {
        let _ = env_logger::try_init();

        let sps_params = SpsParams {
            malformed_scaling_list: true,
            ..Default::default()
        };
        let packet = setup_packet(&sps_params, false, 0);

        let mut parser = Parser::new();
        parser.parse_video_data(&packet).unwrap();

        let sps = parser.get_sps(0).unwrap();
        assert!(sps.scaling_list_enabled_flag);
        assert!(sps.sps_scaling_list_data_present_flag);
        // The seeded defaults survive the failed parse.
        assert_eq!(sps.scaling_list_data.scaling_list[1][0], DEFAULT_SCALING_LIST_INTRA);
        assert_eq!(sps.scaling_list_data.scaling_list[2][4], DEFAULT_SCALING_LIST_INTER);
        assert_eq!(sps.scaling_list_data.scaling_list_dc_coef[0][0], 16);
        // The fields after the scaling block stayed in sync.
        assert_eq!(sps.num_short_term_ref_pic_sets, 0);
        assert!(!sps.sample_adaptive_offset_enabled_flag);
        // The PPS following the SPS in the same packet parsed.
        assert!(parser.get_pps(0).is_some());
    }

    #[test]
    fn malformed_slice_rps_is_best_effort() {
        let _ = env_logger::try_init();

        let mut packet = setup_packet(&SpsParams::default(), false, 0);
        packet.extend(annex_b_nalu(NaluType::IdrWRadl, &idr_slice_rbsp()));

        let mut parser = Parser::new();
        parser.parse_video_data(&packet).unwrap();

        let slice = annex_b_nalu(NaluType::TrailR, &malformed_rps_slice_rbsp(5, 8));
        parser.parse_video_data(&slice).unwrap();

        // The header keeps the default (empty) set and the reads after the
        // RPS stay in sync.
        assert_eq!(parser.poc().curr_poc, 5);
        let header = parser.slice_header();
        assert_eq!(header.slice_type, SliceType::I);
        assert_eq!(header.st_rps.num_of_pics, 0);
        assert_eq!(header.st_rps.num_negative_pics, 0);
        assert_eq!(header.slice_qp_delta, 0);
    }
}
